use crate::config::AssignmentConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the assignment configuration by merging TOML, environment
    /// variables, and JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed, or
    /// if the merged configuration fails validation.
    pub fn load() -> Result<AssignmentConfig> {
        let config: AssignmentConfig = Figment::new()
            .merge(Toml::file("config/Assignment.toml"))
            .merge(Env::prefixed("AUTOCLOSE_"))
            .join(Json::file("config/Assignment.json"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Loads the assignment configuration with a specific profile.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed, or
    /// if the merged configuration fails validation.
    pub fn load_with_profile(profile: &str) -> Result<AssignmentConfig> {
        let config: AssignmentConfig = Figment::new()
            .merge(Toml::file("config/Assignment.toml"))
            .merge(Toml::file(format!("config/Assignment.{profile}.toml")))
            .merge(Env::prefixed("AUTOCLOSE_"))
            .join(Json::file("config/Assignment.json"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }
}
