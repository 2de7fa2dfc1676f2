//! The `utils` module provides definitions used across the broker:
//! error types shared by every layer and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, ErrorKind};

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, ErrorKind};
    use super::logging;
    use crate::persistence::StoreError;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("bogus");
    }

    #[test]
    fn broker_errors_map_to_wire_kinds() {
        let full = BrokerError::QueueFull {
            topic: "jobs".into(),
            capacity: 3,
        };
        assert_eq!(full.kind(), ErrorKind::QueueFull);
        assert_eq!(full.to_string(), "queue `jobs` is full (capacity 3)");

        let store: BrokerError = StoreError::Unavailable("disk gone".into()).into();
        assert_eq!(store.kind(), ErrorKind::PersistenceFailure);
    }

    #[test]
    fn error_kind_serializes_by_name() {
        let json = serde_json::to_string(&ErrorKind::UnknownMessageId).unwrap();
        assert_eq!(json, "\"UnknownMessageId\"");
        assert_eq!(ErrorKind::InvalidMode.to_string(), "InvalidMode");
    }
}
