//! x86 exception identities and the contributory/benign classing used when
//! faults nest during delivery.

/// A fault or trap raised while executing or delivering. Selector-error
/// variants carry the architectural error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    SegmentNotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { addr: u32, error_code: u32 },
    FpuError,
    AlignmentCheck,
}

/// Classing for double-fault escalation: a contributory fault raised while
/// delivering a contributory fault (or a #PF while delivering a #PF) is a
/// double fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Contributory,
    Page,
}

impl Exception {
    /// #GP with a null error code, the most common protection fault.
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::FpuError => 16,
            Exception::AlignmentCheck => 17,
        }
    }

    /// The error code pushed on delivery, for the vectors that push one.
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(sel) => Some(sel as u32),
            Exception::SegmentNotPresent(sel) => Some(sel as u32),
            Exception::StackFault(sel) => Some(sel as u32),
            Exception::GeneralProtection(sel) => Some(sel as u32),
            Exception::PageFault { error_code, .. } => Some(error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    pub fn class(&self) -> FaultClass {
        match self {
            Exception::DivideError
            | Exception::InvalidTss(_)
            | Exception::SegmentNotPresent(_)
            | Exception::StackFault(_)
            | Exception::GeneralProtection(_) => FaultClass::Contributory,
            Exception::PageFault { .. } => FaultClass::Page,
            _ => FaultClass::Benign,
        }
    }

    /// Traps leave EIP pointing past the trapping instruction; faults
    /// restore it to the start.
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            Exception::Breakpoint | Exception::Overflow | Exception::Debug
        )
    }
}
