use std::borrow::Cow;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),

    #[error("device unreachable: {0}")]
    DeviceUnreachable(#[source] std::io::Error),

    #[error("unexpected register content: {0}")]
    Protocol(Cow<'static, str>),

    #[error("raw reading `{0}` is missing")]
    Mapping(String),

    #[error("broker unreachable: {0}")]
    BrokerUnreachable(Cow<'static, str>),

    #[error("broker rejected credentials: {0:?}")]
    Auth(rumqttc::ConnectReturnCode),

    #[error("publish failed: {0}")]
    Publish(Cow<'static, str>),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),
}

impl Error {
    /// Only configuration problems stop the agent; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    pub(crate) fn config<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::Config(reason.into())
    }

    pub(crate) fn protocol<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::Protocol(reason.into())
    }

    pub(crate) fn publish<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::Publish(reason.into())
    }

    pub(crate) fn broker<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Error::BrokerUnreachable(reason.into())
    }

    /// Classify a CONNACK that did not accept the session.
    pub(crate) fn refused(code: rumqttc::ConnectReturnCode) -> Self {
        use rumqttc::ConnectReturnCode as Code;

        match code {
            Code::BadUserNamePassword | Code::NotAuthorized => Error::Auth(code),
            code => Error::broker(format!("connection refused: {:?}", code)),
        }
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(error: rumqttc::ClientError) -> Self {
        Error::publish(error.to_string())
    }
}

impl From<rumqttc::ConnectionError> for Error {
    fn from(error: rumqttc::ConnectionError) -> Self {
        match error {
            rumqttc::ConnectionError::ConnectionRefused(code) => Error::refused(code),
            other => Error::broker(other.to_string()),
        }
    }
}

#[test]
fn only_config_errors_are_fatal() {
    assert!(Error::config("missing ip_addr").is_fatal());
    assert!(!Error::protocol("no marker").is_fatal());
    assert!(!Error::Mapping("701/W_SF".to_owned()).is_fatal());
    assert!(!Error::publish("not connected").is_fatal());
    assert!(!Error::DeviceUnreachable(std::io::ErrorKind::TimedOut.into()).is_fatal());
}

#[test]
fn refused_credentials_become_auth_errors() {
    let error: Error =
        rumqttc::ConnectionError::ConnectionRefused(rumqttc::ConnectReturnCode::NotAuthorized)
            .into();
    assert!(matches!(
        error,
        Error::Auth(rumqttc::ConnectReturnCode::NotAuthorized)
    ));

    let error: Error = rumqttc::ConnectionError::ConnectionRefused(
        rumqttc::ConnectReturnCode::ServiceUnavailable,
    )
    .into();
    assert!(matches!(error, Error::BrokerUnreachable(_)));
}
