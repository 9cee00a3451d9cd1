//! Remote exception representation.

use std::error::Error as StdError;
use std::fmt;

use crate::error::{FrameError, Result};
use crate::frame::{Frame, FrameBuilder};

/// Deepest inner-fault chain accepted off the wire.
pub const MAX_FAULT_DEPTH: usize = 32;

/// A reconstructed remote error: type name, message, stack trace and chained inner fault.
///
/// The original error value never crosses the wire, only this description of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Fully qualified type name of the originating error.
    pub type_name: String,
    /// Display text of the originating error.
    pub message: String,
    /// Backtrace captured where the fault was built (may be empty).
    pub stack_trace: String,
    /// The error's source, if any.
    pub inner: Option<Box<Fault>>,
}

impl Fault {
    /// Create a fault with no stack trace or inner fault.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: String::new(),
            inner: None,
        }
    }

    /// Describe `error`, capturing its type name, a backtrace and its source chain.
    ///
    /// Only the outermost type name is exact. Sources are reached as `dyn Error`, so
    /// each inner fault is named by the leading identifier of its `Debug` output, which
    /// is the type name for derived `Debug` impls. Use [`Fault::with_inner`] when the
    /// inner names must be exact.
    pub fn from_error<E: StdError>(error: &E) -> Self {
        let mut fault = Self::new(std::any::type_name::<E>(), error.to_string());
        fault.stack_trace = std::backtrace::Backtrace::capture().to_string();
        fault.inner = error.source().map(|source| Box::new(Self::from_source(source)));
        fault
    }

    fn from_source(error: &(dyn StdError + 'static)) -> Self {
        let mut fault = Self::new(debug_type_name(error), error.to_string());
        fault.inner = error.source().map(|source| Box::new(Self::from_source(source)));
        fault
    }

    /// Attach a stack trace.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Attach an inner fault.
    #[must_use]
    pub fn with_inner(mut self, inner: Self) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Append the fault and its inner chain.
    pub fn write(&self, builder: &mut FrameBuilder) {
        builder
            .write_string(&self.type_name)
            .write_string(&self.message)
            .write_string(&self.stack_trace)
            .write_bool(self.inner.is_some());
        if let Some(inner) = &self.inner {
            inner.write(builder);
        }
    }

    /// Read a fault written by [`Fault::write`].
    ///
    /// # Errors
    ///
    /// Fails on truncated input or a chain deeper than [`MAX_FAULT_DEPTH`].
    pub fn read(frame: &mut Frame) -> Result<Self> {
        Self::read_at_depth(frame, 0)
    }

    fn read_at_depth(frame: &mut Frame, depth: usize) -> Result<Self> {
        if depth >= MAX_FAULT_DEPTH {
            return Err(FrameError::FaultTooDeep(MAX_FAULT_DEPTH));
        }
        let type_name = frame.take_string()?;
        let message = frame.take_string()?;
        let stack_trace = frame.take_string()?;
        let inner = if frame.take_bool()? {
            Some(Box::new(Self::read_at_depth(frame, depth + 1)?))
        } else {
            None
        };
        Ok(Self {
            type_name,
            message,
            stack_trace,
            inner,
        })
    }
}

fn debug_type_name(error: &dyn StdError) -> String {
    let debug = format!("{error:?}");
    let head: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || matches!(c, '_' | ':'))
        .collect();
    if head.is_empty() {
        "dyn Error".to_string()
    } else {
        head
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .as_deref()
            .map(|inner| inner as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("outer failed")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_from_error_captures_chain() {
        let error = Outer(std::io::Error::other("disk gone"));
        let fault = Fault::from_error(&error);

        assert!(fault.type_name.ends_with("Outer"));
        assert_eq!(fault.message, "outer failed");
        assert_eq!(fault.inner.as_ref().unwrap().message, "disk gone");
    }

    #[derive(Debug, thiserror::Error)]
    #[error("disk gone")]
    struct DiskGone;

    #[derive(Debug, thiserror::Error)]
    #[error("save failed")]
    struct SaveFailed(#[source] DiskGone);

    #[derive(Debug, thiserror::Error)]
    #[error("sync failed")]
    struct SyncFailed {
        #[source]
        cause: SaveFailed,
    }

    #[test]
    fn test_inner_faults_keep_their_type_names() {
        let fault = Fault::from_error(&SyncFailed {
            cause: SaveFailed(DiskGone),
        });
        assert!(fault.type_name.ends_with("SyncFailed"));

        let save = fault.inner.as_deref().unwrap();
        assert_eq!(save.type_name, "SaveFailed");
        assert_eq!(save.message, "save failed");

        let disk = save.inner.as_deref().unwrap();
        assert_eq!(disk.type_name, "DiskGone");
        assert_eq!(disk.message, "disk gone");
        assert!(disk.inner.is_none());
    }

    #[test]
    fn test_wire_roundtrip_with_inner() {
        let fault = Fault::new("app::Error", "boom")
            .with_stack_trace("at main")
            .with_inner(Fault::new("std::io::Error", "eof"));

        let mut builder = FrameBuilder::new();
        fault.write(&mut builder);
        let mut frame = builder.into_frame();

        assert_eq!(Fault::read(&mut frame).unwrap(), fault);
        assert!(frame.is_exhausted());
    }

    #[test]
    fn test_depth_limit() {
        let mut fault = Fault::new("leaf", "leaf");
        for _ in 0..MAX_FAULT_DEPTH {
            fault = Fault::new("node", "node").with_inner(fault);
        }
        let mut builder = FrameBuilder::new();
        fault.write(&mut builder);

        assert!(matches!(
            Fault::read(&mut builder.into_frame()),
            Err(FrameError::FaultTooDeep(_))
        ));
    }
}
