// Configuration loading for Herald services

pub mod env;
pub mod error;

pub use env::{EnvLoader, Vars};
pub use error::{ConfigError, Result};

/// Load variables with the given prefix, reading `.env` from the working
/// directory first when present.
pub fn load_prefixed(prefix: &str) -> Result<Vars> {
    let loader = EnvLoader::with_prefix(prefix);
    loader.load_dotenv(None)?;
    loader.load()
}
