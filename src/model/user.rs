/// Identity the local mutation queue is namespaced by.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage namespace for per-user state.
    pub fn key(&self) -> &str {
        self.uid.as_deref().unwrap_or("anonymous-user")
    }
}
