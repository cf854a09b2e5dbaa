//! Legacy timer fabric: the 8254 interval timer and the MC146818 RTC/CMOS.
//!
//! Both devices are driven by a microsecond clock passed into `tick`; they
//! report how many interrupt edges elapsed since the previous tick and the
//! embedding machine turns those into PIC pulses.

pub mod pit8254;
pub mod rtc;

pub use pit8254::{Pit, PIT_CH0, PIT_CH1, PIT_CH2, PIT_CMD};
pub use rtc::{Rtc, CMOS_DATA, CMOS_INDEX};
