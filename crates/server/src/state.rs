//! Application state

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::CommandDispatcher;
use crate::inbound::{HttpForwardHandler, InboundHandler, NoopHandler};
use crate::keepalive::DEFAULT_KEEPALIVE_PERIOD;
use crate::registry::ConnectionRegistry;
use crate::skill::CaptureNoteSkill;
use crate::verifier::{load_key_file, JwksVerifier, TokenVerifier, VerifierConfig};

/// Shared application state
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: CommandDispatcher,
    pub skill: CaptureNoteSkill,
    pub verifier: Arc<dyn TokenVerifier>,
    pub handler: Arc<dyn InboundHandler>,
    pub keepalive_period: Duration,
}

impl AppState {
    pub fn new(verifier: Arc<dyn TokenVerifier>, handler: Arc<dyn InboundHandler>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = CommandDispatcher::new(registry.clone());
        Self {
            skill: CaptureNoteSkill::new(dispatcher.clone()),
            registry,
            dispatcher,
            verifier,
            handler,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut verifier_config = match (&config.jwks_file, &config.jwks_url) {
            (Some(path), _) => VerifierConfig::static_keys(load_key_file(path)?),
            (None, Some(url)) => VerifierConfig::remote(url, config.jwks_cache_ttl()),
            (None, None) => anyhow::bail!("either --jwks-url or --jwks-file is required"),
        };
        verifier_config.issuer = config.issuer.clone();
        verifier_config.audience = config.audience.clone();
        let verifier: Arc<dyn TokenVerifier> = Arc::new(JwksVerifier::new(verifier_config)?);

        let handler: Arc<dyn InboundHandler> = match &config.handler_url {
            Some(url) => Arc::new(HttpForwardHandler::new(url.clone())?),
            None => Arc::new(NoopHandler),
        };

        let mut state = Self::new(verifier, handler);
        state.keepalive_period = config.keepalive_period();
        Ok(state)
    }
}
