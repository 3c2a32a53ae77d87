//! Reasons for replacing a container.

/// Ordered list of reasons an existing container must be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReasons(Vec<String>);

impl RemovalReasons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reason: impl Into<String>) {
        self.0.push(reason.into());
    }

    /// Adds `reason` when `condition` holds.
    pub fn add_if(&mut self, condition: bool, reason: impl FnOnce() -> String) {
        if condition {
            self.0.push(reason());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for RemovalReasons {
    fn from(reason: &str) -> Self {
        Self(vec![reason.to_string()])
    }
}

impl std::fmt::Display for RemovalReasons {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}
