//! Demo topic handlers
//!
//! Business logic lives outside the core crates; these handlers back the
//! end-to-end scenarios and the sample worker profiles.

pub mod echo;
pub mod heavy;
pub mod signup;
pub mod todo;

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use microman_worker::{HandlerContext, HandlerError, RegistryError, TopicRegistry};

use crate::auth::{TokenError, TokenSigner};

/// Which handlers a worker process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// `echo`, `echo.get`, `echo.all`, `echo:all`, `echo.slow`
    Echo,
    /// `heavy`, `signup`, `todo:create`
    Misc,
    All,
}

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub secret: String,
    pub token_ttl_days: i64,
    pub slow_delay: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            secret: "microman-dev-secret".to_string(),
            token_ttl_days: 7,
            slow_delay: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Check a trimmed string field's length, `min..=max` characters
pub(crate) fn validate_len<'a>(
    field: &str,
    value: &'a str,
    min: usize,
    max: usize,
) -> Result<&'a str, HandlerError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(HandlerError::InvalidPayload(format!(
            "\"{}\" length must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(value)
}

fn register_echo(registry: &mut TopicRegistry, options: &HandlerOptions) -> Result<(), RegistryError> {
    let delay = options.slow_delay;
    registry
        .register_public("echo", echo::echo)?
        .register_public("echo.get", echo::echo_get)?
        .register_public("echo.all", echo::echo_all)?
        .register_public("echo:all", echo::echo_all)?
        .register_public("echo.slow", move |ctx: HandlerContext| echo::echo_slow(ctx, delay))?;
    Ok(())
}

fn register_misc(registry: &mut TopicRegistry, options: &HandlerOptions) -> Result<(), SetupError> {
    let signer = Arc::new(TokenSigner::new(&options.secret, options.token_ttl_days)?);
    registry
        .register_public("heavy", heavy::heavy)?
        .register_public("signup", move |ctx: HandlerContext| {
            let signer = Arc::clone(&signer);
            async move { signup::signup(ctx, &signer).await }
        })?
        .register("todo:create", todo::create)?;
    Ok(())
}

/// Dispatch table for a worker profile
pub fn registry(profile: Profile, options: &HandlerOptions) -> Result<TopicRegistry, SetupError> {
    let mut registry = TopicRegistry::new();
    if matches!(profile, Profile::Echo | Profile::All) {
        register_echo(&mut registry, options)?;
    }
    if matches!(profile, Profile::Misc | Profile::All) {
        register_misc(&mut registry, options)?;
    }
    Ok(registry)
}
