//! Handling for errors no retry policy can recover from.

/// Abort the process as gracefully as possible due to a fatal
/// non-recoverable condition, e.g. corruption of the wire codec.
pub trait ControlFatal<T, E>: Sized + sealed::Sealed {
    /// Panic with a full error report
    fn control_fatal(self) -> T;
}

impl<T, E> ControlFatal<T, E> for Result<T, E>
where
    E: std::fmt::Debug + std::error::Error + Send + Sync + 'static,
{
    fn control_fatal(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => {
                let report = eyre::Report::new(e);
                panic!("{report:?}")
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}
