use std::collections::BTreeMap;
use std::fmt::Display;

/// Result of a health probe: pass/fail, a human readable message and named numeric diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    healthy:    bool,
    message:    String,
    properties: BTreeMap<String, f64>,
}

impl HealthStatus {
    pub fn healthy<S: Into<String>>(message: S) -> Self {
        Self {
            healthy:    true,
            message:    message.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn unhealthy<S: Into<String>>(message: S) -> Self {
        Self {
            healthy:    false,
            message:    message.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn set_property<S: Into<String>>(&mut self, name: S, value: f64) {
        self.properties.insert(name.into(), value);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn properties(&self) -> &BTreeMap<String, f64> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<f64> {
        self.properties.get(name).copied()
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", if self.healthy { "OK" } else { "FAIL" }, self.message)?;
        for (name, value) in &self.properties {
            write!(f, "; {name}={value}")?;
        }
        Ok(())
    }
}
