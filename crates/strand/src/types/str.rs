/// Immutable string stored on the heap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Str(String);

impl Str {
    #[must_use]
    pub fn new(s: String) -> Self {
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Str {
    fn from(s: String) -> Self {
        Self(s)
    }
}
