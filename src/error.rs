use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Serialization error"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Unknown payload type: {payload_type}"))]
    UnknownPayloadType { payload_type: String },

    #[snafu(display("Payload of type {payload_type} could not be decoded: {reason}"))]
    UndecodablePayload {
        payload_type: String,
        reason: String,
    },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn tenant_not_found(tenant: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("tenant {}", tenant.into()),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// True when the underlying database error is a unique-constraint
    /// violation. Inbox consumers use this to detect a duplicate delivery.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx {
                source: sqlx::Error::Database(db),
            } => db.is_unique_violation(),
            _ => false,
        }
    }
}
