#[cfg(feature = "debug")]
#[macro_export]
macro_rules! debugln {
    ($($rest:tt)*) => {
        log::debug!($($rest)*)
    }
}

#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! debugln {
    ($($rest:tt)*) => {
        ()
    };
}

/// Logs a warning for a recoverable anomaly (bad register access,
/// out-of-range address, malformed save state field) without aborting
/// emulation. Routed through [`log`] so hosts control verbosity and
/// rate-limiting rather than the core writing to stdout directly.
#[macro_export]
macro_rules! warnln {
    ($($rest:tt)*) => {
        log::warn!($($rest)*)
    }
}

/// Panics with a formatted message, reserved for invariant violations
/// that indicate a bug in the core itself rather than anomalous guest
/// behavior (guest anomalies use [`warnln`] and a defined fallback).
#[macro_export]
macro_rules! panic_gba {
    ($($rest:tt)*) => {
        panic!($($rest)*)
    }
}

/// Like `assert!`, but only active in builds with the `pedantic`
/// feature enabled, for checks that are useful during development but
/// too costly or too strict to carry in every build.
#[cfg(feature = "pedantic")]
#[macro_export]
macro_rules! assert_pedantic_gba {
    ($($rest:tt)*) => {
        assert!($($rest)*)
    }
}

#[cfg(not(feature = "pedantic"))]
#[macro_export]
macro_rules! assert_pedantic_gba {
    ($($rest:tt)*) => {
        ()
    };
}
