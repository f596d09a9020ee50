//! Unit tests for `AppError` display, classification, and conversions.

use std::time::Duration;

use agent_conduit::AppError;

/// Display strings use the `kind: detail` form.
#[test]
fn display_formats() {
    assert_eq!(
        AppError::ExecutableNotFound("claude".into()).to_string(),
        "executable not found: claude"
    );
    assert_eq!(
        AppError::ControlError("bad mode".into()).to_string(),
        "control error: bad mode"
    );
    assert_eq!(
        AppError::RequestTimeout {
            subtype: "interrupt".into(),
            timeout: Duration::from_millis(50),
        }
        .to_string(),
        "request timeout: interrupt after 50ms"
    );
    assert_eq!(
        AppError::MalformedFrame {
            line: "junk".into(),
            reason: "expected a JSON object".into(),
        }
        .to_string(),
        "malformed frame: expected a JSON object"
    );
}

/// Process exits describe the code or signal and append stderr.
#[test]
fn process_exit_display_includes_stderr() {
    let err = AppError::ProcessExited {
        code: Some(1),
        signal: None,
        stderr: Some("fatal: boom".into()),
    };
    assert_eq!(err.to_string(), "process exited: exit code 1\nstderr: fatal: boom");
    assert_eq!(err.exit_code(), Some(1));

    let signalled = AppError::ProcessExited {
        code: None,
        signal: Some(15),
        stderr: None,
    };
    assert_eq!(signalled.to_string(), "process exited: killed by signal 15");
    assert_eq!(signalled.exit_code(), None);
}

/// Only per-message and per-exchange errors are recoverable.
#[test]
fn recoverability_classification() {
    let recoverable = [
        AppError::MalformedFrame {
            line: String::new(),
            reason: String::new(),
        },
        AppError::ProtocolViolation("x".into()),
        AppError::HandlerFailure("x".into()),
        AppError::ControlError("x".into()),
        AppError::RequestTimeout {
            subtype: "x".into(),
            timeout: Duration::from_secs(1),
        },
    ];
    for err in recoverable {
        assert!(err.is_recoverable(), "{err} should be recoverable");
    }

    let terminal = [
        AppError::ExecutableNotFound("x".into()),
        AppError::ProcessExited {
            code: Some(1),
            signal: None,
            stderr: None,
        },
        AppError::BrokenPipe("x".into()),
        AppError::SessionClosed("x".into()),
        AppError::Config("x".into()),
        AppError::Io("x".into()),
    ];
    for err in terminal {
        assert!(!err.is_recoverable(), "{err} should be terminal");
    }
}

/// Broken-pipe I/O errors map to `BrokenPipe`, others to `Io`.
#[test]
fn io_error_conversion() {
    let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    assert!(matches!(AppError::from(pipe), AppError::BrokenPipe(_)));

    let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    assert!(matches!(AppError::from(other), AppError::Io(_)));
}

/// TOML errors become configuration errors.
#[test]
fn toml_error_conversion() {
    let err = toml::from_str::<toml::Value>("= nope").expect_err("invalid toml");
    let converted = AppError::from(err);
    assert!(matches!(converted, AppError::Config(_)));
    assert!(converted.to_string().starts_with("config: invalid config:"));
}
