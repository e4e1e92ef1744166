use core::fmt;

/// Cache overrides given on the command line
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Flags {
    pub(crate) clean_cache: bool,
    pub(crate) force_dd: bool,
    pub(crate) force_format: bool,
    pub(crate) force_copy: bool,
}

/// The phases to run
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Plan {
    /// Create a new zeroed disk
    pub(crate) allocate: bool,

    /// Create the partition table
    pub(crate) partition: bool,

    /// Create a new filesystem in the partition
    pub(crate) format: bool,

    /// Replace files already on the filesystem
    pub(crate) replace: bool,
}

impl Plan {
    /// Decides which phases to run.
    ///
    /// A missing output file forces everything. An existing one is assumed to already hold the
    /// partition table and the filesystem, and only gets populated again unless forced.
    pub(crate) fn new(output_exists: bool, flags: Flags) -> Self {
        let flags = if output_exists {
            flags
        } else {
            Flags {
                clean_cache: true,
                force_dd: true,
                ..flags
            }
        };

        if flags.force_dd {
            return Self {
                allocate: true,
                partition: true,
                format: true,
                replace: true,
            };
        }

        if flags.clean_cache {
            return Self {
                allocate: false,
                partition: false,
                format: true,
                replace: true,
            };
        }

        Self {
            allocate: false,
            partition: false,
            format: flags.force_format,
            replace: flags.force_copy,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut phases = Vec::new();

        if self.allocate {
            phases.push("allocate");
        }

        if self.partition {
            phases.push("partition");
        }

        if self.format {
            phases.push("format");
        }

        phases.push(if self.replace {
            "copy (replace)"
        } else {
            "copy"
        });

        f.write_str(&phases.join(", "))
    }
}
