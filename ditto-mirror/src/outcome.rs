/// One of the two halves of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendRole {
    /// Authoritative read source; wins any metadata conflict.
    Prime,
    Alter,
}

impl BackendRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendRole::Prime => "prime",
            BackendRole::Alter => "alter",
        }
    }
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend(s) produced a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    /// Read answered by Prime.
    Primary,
    /// Read answered by Alter after Prime could not serve it.
    Fallback,
    /// Mutation applied on both backends.
    Mirrored,
    /// Mutation applied on Prime only.
    Degraded,
}

impl ServedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedBy::Primary => "primary",
            ServedBy::Fallback => "fallback",
            ServedBy::Mirrored => "mirrored",
            ServedBy::Degraded => "degraded",
        }
    }
}

/// A successful result together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub served_by: ServedBy,
}

impl<T> Outcome<T> {
    pub fn new(value: T, served_by: ServedBy) -> Self {
        Self { value, served_by }
    }

    pub fn primary(value: T) -> Self {
        Self::new(value, ServedBy::Primary)
    }

    pub fn fallback(value: T) -> Self {
        Self::new(value, ServedBy::Fallback)
    }

    pub fn mirrored(value: T) -> Self {
        Self::new(value, ServedBy::Mirrored)
    }

    pub fn degraded(value: T) -> Self {
        Self::new(value, ServedBy::Degraded)
    }

    pub fn is_degraded(&self) -> bool {
        self.served_by == ServedBy::Degraded
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            served_by: self.served_by,
        }
    }
}
