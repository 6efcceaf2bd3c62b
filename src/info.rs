//! General information about the crate and the emulator core it runs.

pub struct Info;

impl Info {
    /// Obtains the name of the emulator core.
    pub fn name() -> String {
        String::from("OxideGBA")
    }

    /// Obtains the name of the emulator core in lowercase, useful for
    /// file paths and other case-sensitive contexts.
    pub fn name_lower() -> String {
        String::from(env!("CARGO_PKG_NAME"))
    }

    /// Obtains the version of the crate, as declared in `Cargo.toml`.
    pub fn version() -> String {
        String::from(env!("CARGO_PKG_VERSION"))
    }

    /// Obtains the system this core emulates.
    pub fn system() -> String {
        String::from("Game Boy Advance")
    }

    /// Obtains the name of the compiler used to build the crate.
    /// Can be used for diagnostics.
    pub fn compiler() -> String {
        String::from("rustc")
    }
}
