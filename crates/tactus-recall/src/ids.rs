//! Identifiers used across the recall graph.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// An audio stream: a group of channels.
    TrackId,
    "track"
);
id_type!(
    /// One channel (pad) of a track.
    ChannelId,
    "channel"
);
id_type!(
    /// A recall template, shared by all its per-invocation instances.
    TemplateId,
    "recall"
);
id_type!(
    /// One attached effect.
    ContainerId,
    "container"
);
id_type!(
    /// One buffer chain inside a recycling context.
    RecyclingId,
    "recycling"
);
id_type!(
    /// One playback, record, export or notation run.
    InvocationId,
    "invocation"
);
