//! Configuration options for the HSD stream store.

use crate::pipeline::WriteFlag;

/// Engine options used when opening or initializing a stream.
///
/// These tune the engine's behaviour on this handle only. Everything that
/// shapes the on-disk format of a stream lives in the [`Manifest`](crate::Manifest).
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the stream directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Fsync after every durable pipeline step.
    /// Disabling makes crash recovery best-effort but speeds up writes.
    /// Default: true
    pub sync_writes: bool,

    /// Number of stream slots in the shared `streams.list` folder index.
    /// Default: 256
    pub max_streams_per_folder: usize,

    /// Shortest signature accepted from a signer.
    /// Default: 64
    pub min_signature_len: usize,

    /// Stop the pipeline right after this write flag becomes durable and
    /// return [`Error::Interrupted`](crate::Error::Interrupted).
    ///
    /// Only useful for crash simulation in tests.
    /// Default: None
    pub halt_after: Option<WriteFlag>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_writes: true,
            max_streams_per_folder: 256,
            min_signature_len: 64,
            halt_after: None,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the stream directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Enables or disables fsync after each durable step.
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Sets the number of folder slots.
    pub fn max_streams_per_folder(mut self, slots: usize) -> Self {
        self.max_streams_per_folder = slots;
        self
    }

    /// Sets the shortest accepted signature.
    pub fn min_signature_len(mut self, len: usize) -> Self {
        self.min_signature_len = len;
        self
    }

    /// Installs the crash-simulation hook.
    pub fn halt_after(mut self, flag: WriteFlag) -> Self {
        self.halt_after = Some(flag);
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_streams_per_folder == 0 {
            return Err(crate::Error::invalid_argument("max_streams_per_folder must be > 0"));
        }
        // slot offsets are 16 * slot + 8 and must fit the u32 cell addressing
        if self.max_streams_per_folder > (u32::MAX as usize / 16) - 1 {
            return Err(crate::Error::invalid_argument("max_streams_per_folder is too large"));
        }
        if self.min_signature_len > u16::MAX as usize {
            return Err(crate::Error::invalid_argument(
                "min_signature_len cannot exceed the signature length field",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert!(opts.sync_writes);
        assert_eq!(opts.max_streams_per_folder, 256);
        assert_eq!(opts.min_signature_len, 64);
        assert!(opts.halt_after.is_none());
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .sync_writes(false)
            .min_signature_len(32)
            .halt_after(WriteFlag::BlockIndex);

        assert!(!opts.sync_writes);
        assert_eq!(opts.min_signature_len, 32);
        assert_eq!(opts.halt_after, Some(WriteFlag::BlockIndex));
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.max_streams_per_folder = 0;
        assert!(opts.validate().is_err());

        opts.max_streams_per_folder = 4;
        opts.min_signature_len = 70_000;
        assert!(opts.validate().is_err());
    }
}
