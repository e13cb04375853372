use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::request::{LoadRequest, Model, Options};

/// The fingerprint of a load.
///
/// Requests with equal keys are served by the same active resource, cache entry or job.
/// Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EngineKey(Arc<KeyParts>);

#[derive(Debug, PartialEq, Eq, Hash)]
struct KeyParts {
    model: Model,
    signature: String,
    width: u32,
    height: u32,
    transformations: BTreeMap<String, String>,
    resource_class: String,
    transcode_class: String,
    options: Options,
}

impl EngineKey {
    pub fn new(request: &LoadRequest) -> Self {
        Self(Arc::new(KeyParts {
            model: request.model.clone(),
            signature: request.signature.clone(),
            width: request.width,
            height: request.height,
            transformations: request.transformations.clone(),
            resource_class: request.resource_class.clone(),
            transcode_class: request.transcode_class.clone(),
            options: request.options.clone(),
        }))
    }

    pub fn model(&self) -> &Model {
        &self.0.model
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = &self.0;
        write!(f, "{}@{}x{}", parts.model, parts.width, parts.height)?;
        if !parts.signature.is_empty() {
            write!(f, "#{}", parts.signature)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
