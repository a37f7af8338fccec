//! Error taxonomy for disk image assembly.
//!
//! Validation errors are raised before any external command runs. Command
//! errors carry the captured output of the failing program. State errors
//! distinguish an image that was never set up from one that is not mounted.
//! Cleanup errors never replace the error that triggered the cleanup; both
//! stay observable through [`ImageError::WithCleanup`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    // Validation
    #[error("{label} partition table supports at most {max} partitions, layout has {found}")]
    TooManyPartitions {
        label: &'static str,
        max: usize,
        found: usize,
    },
    #[error("size of {bytes} bytes is not aligned to {alignment} sectors of 512 bytes")]
    MisalignedSize { bytes: u64, alignment: u64 },
    #[error("size of {mib} MiB is too large")]
    SizeTooLarge { mib: u64 },
    #[error("partition '{label}' uses the remaining space but is not the last partition")]
    RemainingNotLast { label: String },
    #[error("partition layout has no partitions")]
    EmptyLayout,
    #[error("{flag} flag requested for partition {index}, layout has {count} partitions")]
    FlagIndexOutOfRange {
        flag: &'static str,
        index: usize,
        count: usize,
    },
    #[error("unsupported architecture '{0}'")]
    UnsupportedArchitecture(String),
    #[error("unsupported partition table type '{0}' (expected 'gpt' or 'msdos')")]
    UnsupportedLabel(String),
    #[error("unknown partition layout '{0}' (expected 'system-AB' or 'minimal')")]
    UnknownPartitionLayout(String),
    #[error("unsupported bootloader '{0}' (expected 'grub' or 'u-boot')")]
    UnsupportedBootloader(String),
    #[error("partitions need {needed} bytes but the image is only {available} bytes")]
    ImageTooSmall { needed: u64, available: u64 },
    #[error("boot asset target '{}' must be a relative path inside the boot partition", .0.display())]
    InvalidAssetTarget(PathBuf),
    #[error(
        "raw boot asset '{}' ends at byte {end}, past the first partition at byte {limit}",
        .path.display()
    )]
    RawAssetOverlapsPartition { path: PathBuf, end: u64, limit: u64 },

    // External commands
    #[error("failed to start {command}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("partitioning failed: {output}")]
    PartitioningFailed { output: String },

    // Loop-device mapping
    #[error("unable to parse partition mapping output line '{line}'")]
    MapParse { line: String },
    #[error("expected {expected} mapped partitions, found {found}")]
    MapCount { expected: usize, found: usize },

    // State
    #[error("image is not set up: it has not been {0}")]
    NotSetUp(&'static str),
    #[error("image is not mounted")]
    NotMounted,

    // Cleanup
    #[error("{error}; cleanup also failed: {}", Joined(.cleanup))]
    WithCleanup {
        #[source]
        error: Box<ImageError>,
        cleanup: Vec<ImageError>,
    },
    #[error("cleanup failed: {}", Joined(.0))]
    Cleanup(Vec<ImageError>),
    #[error("'{}' is still mapped: unmount and unmap it before reuse", .0.display())]
    StillMapped(PathBuf),

    // Environment
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid description '{}': {reason}", .path.display())]
    Description { path: PathBuf, reason: String },
    #[error("invalid configuration '{}': {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
    #[error("privilege transition failed: {0}")]
    Privilege(String),
    #[error("backing file '{}' is locked by another build", .0.display())]
    Locked(PathBuf),
}

pub type Result<T> = std::result::Result<T, ImageError>;

impl ImageError {
    /// Wrap an IO error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ImageError::Io {
            context: context.into(),
            source,
        }
    }

    /// Attach cleanup failures to an error, keeping the original as the source.
    pub fn with_cleanup(self, cleanup: Vec<ImageError>) -> Self {
        if cleanup.is_empty() {
            self
        } else {
            ImageError::WithCleanup {
                error: Box::new(self),
                cleanup,
            }
        }
    }

    /// Collapse a list of cleanup failures into a single result.
    pub fn from_cleanup(mut errors: Vec<ImageError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ImageError::Cleanup(errors)),
        }
    }
}

/// Merge the outcome of a step with the outcome of the cleanup that followed it.
///
/// An error from the step wins and keeps the cleanup error attached.
pub fn merge_cleanup<T>(step: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (step, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(cleanup)) => Err(error.with_cleanup(vec![cleanup])),
    }
}

struct Joined<'a>(&'a [ImageError]);

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(command: &str) -> ImageError {
        ImageError::CommandFailed {
            command: command.to_string(),
            output: "boom".to_string(),
        }
    }

    #[test]
    fn test_with_cleanup_keeps_both_errors_visible() {
        let err = failed("grub-install").with_cleanup(vec![failed("umount /x")]);
        let msg = err.to_string();
        assert!(msg.contains("grub-install failed"));
        assert!(msg.contains("cleanup also failed: umount /x failed"));
    }

    #[test]
    fn test_with_cleanup_without_failures_is_identity() {
        let err = failed("parted").with_cleanup(Vec::new());
        assert!(matches!(err, ImageError::CommandFailed { .. }));
    }

    #[test]
    fn test_merge_cleanup_prefers_step_error() {
        let merged: Result<()> = merge_cleanup(Err(failed("mount")), Err(failed("umount")));
        match merged {
            Err(ImageError::WithCleanup { error, cleanup }) => {
                assert!(matches!(*error, ImageError::CommandFailed { .. }));
                assert_eq!(cleanup.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_merge_cleanup_reports_cleanup_after_success() {
        let merged = merge_cleanup(Ok(7), Err(failed("umount")));
        assert!(matches!(merged, Err(ImageError::CommandFailed { .. })));
    }

    #[test]
    fn test_from_cleanup_collapses() {
        assert!(ImageError::from_cleanup(Vec::new()).is_ok());
        assert!(matches!(
            ImageError::from_cleanup(vec![failed("a")]),
            Err(ImageError::CommandFailed { .. })
        ));
        assert!(matches!(
            ImageError::from_cleanup(vec![failed("a"), failed("b")]),
            Err(ImageError::Cleanup(v)) if v.len() == 2
        ));
    }

    #[test]
    fn test_state_errors_are_distinct() {
        assert_ne!(
            ImageError::NotSetUp("mapped").to_string(),
            ImageError::NotMounted.to_string()
        );
    }
}
