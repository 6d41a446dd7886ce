use core::fmt;

/// Built-in throwable classes the core can raise on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThrowableKind {
    RuntimeException = 0,
    NegativeArraySize = 1,
    NoClassDefFound = 2,
    OutOfMemory = 3,
    NullPointer = 4,
    ArrayIndexOutOfBounds = 5,
    VerifyError = 6,
    StackOverflow = 7,
}

impl ThrowableKind {
    pub fn from_u8(code: u8) -> Option<Self> {
        let kind = match code {
            0 => ThrowableKind::RuntimeException,
            1 => ThrowableKind::NegativeArraySize,
            2 => ThrowableKind::NoClassDefFound,
            3 => ThrowableKind::OutOfMemory,
            4 => ThrowableKind::NullPointer,
            5 => ThrowableKind::ArrayIndexOutOfBounds,
            6 => ThrowableKind::VerifyError,
            7 => ThrowableKind::StackOverflow,
            _ => return None,
        };
        Some(kind)
    }

    pub fn descriptor(self) -> &'static str {
        match self {
            ThrowableKind::RuntimeException => "Ljava/lang/RuntimeException;",
            ThrowableKind::NegativeArraySize => {
                "Ljava/lang/NegativeArraySizeException;"
            }
            ThrowableKind::NoClassDefFound => "Ljava/lang/NoClassDefFoundError;",
            ThrowableKind::OutOfMemory => "Ljava/lang/OutOfMemoryError;",
            ThrowableKind::NullPointer => "Ljava/lang/NullPointerException;",
            ThrowableKind::ArrayIndexOutOfBounds => {
                "Ljava/lang/ArrayIndexOutOfBoundsException;"
            }
            ThrowableKind::VerifyError => "Ljava/lang/VerifyError;",
            ThrowableKind::StackOverflow => "Ljava/lang/StackOverflowError;",
        }
    }
}

/// A language-level exception in flight.
///
/// Handlers and collaborators return it as the `Err` side of their result;
/// the dispatch loop turns it into unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throwable {
    pub kind: ThrowableKind,
    pub message: Option<String>,
}

impl Throwable {
    pub fn new(kind: ThrowableKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ThrowableKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn negative_array_size(length: i32) -> Self {
        Self::with_message(ThrowableKind::NegativeArraySize, length.to_string())
    }

    pub fn null_pointer() -> Self {
        Self::new(ThrowableKind::NullPointer)
    }

    pub fn index_out_of_bounds(length: usize, index: i32) -> Self {
        Self::with_message(
            ThrowableKind::ArrayIndexOutOfBounds,
            format!("length={length}; index={index}"),
        )
    }

    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::with_message(ThrowableKind::VerifyError, message)
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind.descriptor()),
            None => f.write_str(self.kind.descriptor()),
        }
    }
}

impl std::error::Error for Throwable {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        for code in 0..=7 {
            let kind = ThrowableKind::from_u8(code).unwrap();
            assert_eq!(kind as u8, code);
        }
        assert_eq!(ThrowableKind::from_u8(8), None);
    }

    #[test]
    fn display_includes_message() {
        assert_eq!(
            Throwable::negative_array_size(-3).to_string(),
            "Ljava/lang/NegativeArraySizeException;: -3"
        );
        assert_eq!(
            Throwable::null_pointer().to_string(),
            "Ljava/lang/NullPointerException;"
        );
    }
}
