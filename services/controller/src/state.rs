//! Application state shared across request handlers.

use std::sync::Arc;

use crate::registration::Registrar;
use crate::template::BootTemplate;
use crate::token::ProvisioningTokens;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    tokens: ProvisioningTokens,
    registrar: Registrar,
    template: BootTemplate,
}

impl AppState {
    pub fn new(tokens: ProvisioningTokens, registrar: Registrar, template: BootTemplate) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                tokens,
                registrar,
                template,
            }),
        }
    }

    pub fn tokens(&self) -> &ProvisioningTokens {
        &self.inner.tokens
    }

    pub fn registrar(&self) -> &Registrar {
        &self.inner.registrar
    }

    pub fn template(&self) -> &BootTemplate {
        &self.inner.template
    }
}
