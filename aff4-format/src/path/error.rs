use std::fmt;

#[derive(Debug, Clone)]
pub enum IntoMemberPathError {
    EmptyPath,
    InvalidEscape,
    NonUtf8,
}

impl std::error::Error for IntoMemberPathError {}

impl fmt::Display for IntoMemberPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl IntoMemberPathError {
    pub fn as_str(&self) -> &str {
        match self {
            IntoMemberPathError::EmptyPath => "no member name provided",
            IntoMemberPathError::InvalidEscape => "invalid percent escape in member name",
            IntoMemberPathError::NonUtf8 => "member name does not decode to UTF-8",
        }
    }
}

impl From<IntoMemberPathError> for crate::Error {
    fn from(err: IntoMemberPathError) -> Self {
        crate::Error::Structural(err.as_str().to_string())
    }
}
