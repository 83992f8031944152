use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::application::Application;

#[derive(Clone)]
/// An application mounted at a path on a node.
pub struct Context {
    path: String,
    mount: String,
    application: Arc<dyn Application>,
    enabled: bool,
}

impl Context {
    pub fn new(
        path: impl Into<String>,
        mount: impl Into<String>,
        application: Arc<dyn Application>,
        enabled: bool,
    ) -> Self {
        Self {
            path: path.into(),
            mount: mount.into(),
            application,
            enabled,
        }
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn mount(&self) -> &str {
        &self.mount
    }

    #[inline]
    pub fn application(&self) -> &Arc<dyn Application> {
        &self.application
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// If a request path falls under this context.
    pub fn matches(&self, request_path: &str) -> bool {
        if self.path == "/" {
            return true;
        }

        match request_path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// A plain description of the context which can be shared with listeners.
    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            path: self.path.clone(),
            mount: self.mount.clone(),
            application: self.application.name().to_string(),
            enabled: self.enabled,
        }
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.path)
            .field("mount", &self.mount)
            .field("application", &self.application.name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub path: String,
    pub mount: String,
    pub application: String,
    pub enabled: bool,
}
