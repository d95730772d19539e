use std::{borrow::Cow, error::Error, fmt, io};

pub(crate) type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Fatal errors which abort the current frame
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(Cow<'static, str>),

    #[error("Required resource {0} is missing")]
    NullResource(&'static str),

    #[error("Hardware submission failed")]
    HardwareSubmission(#[source] BoxError),

    #[error("Failed to allocate {name}")]
    ResourceAllocation {
        name: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Failed to write bitstream")]
    Bitstream(#[from] io::Error),
}

impl EncodeError {
    pub(crate) fn invalid(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub(crate) fn hardware<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::HardwareSubmission(Box::new(error))
    }

    pub(crate) fn allocation<E>(name: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        move |error| Self::ResourceAllocation {
            name,
            source: Box::new(error),
        }
    }
}

/// Constraint violations which are logged and downgraded instead of failing the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftConstraintViolation {
    /// BRC reset was requested while BRC is disabled or running in ICQ mode
    BrcResetIgnored,

    /// Slices disagree on SAO flags, SAO was disabled for the frame
    MixedSliceSao,

    /// A slice requested more active references than the hardware supports
    RefCountClamped {
        slice: usize,
        list: usize,
        requested: usize,
        max: usize,
    },
}

impl fmt::Display for SoftConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrcResetIgnored => {
                f.write_str("BRC reset cannot be triggered in CQP/ICQ modes, ignoring it")
            }
            Self::MixedSliceSao => f.write_str(
                "all slices must have the same SAO setting within a picture, disabling SAO",
            ),
            Self::RefCountClamped {
                slice,
                list,
                requested,
                max,
            } => write!(
                f,
                "slice {slice} requested {requested} L{list} references, clamped to {max}"
            ),
        }
    }
}

impl SoftConstraintViolation {
    pub(crate) fn log(self) -> Self {
        log::warn!("{self}");
        self
    }
}
