use crate::routing::RouteError;

/// Errors from one OSRM round trip.
#[derive(Debug)]
pub enum OsrmError {
    Http(reqwest::Error),
    Status(u16),
    Json(reqwest::Error),
    Api(String),
    NoRoute,
}

impl From<reqwest::Error> for OsrmError {
    fn from(err: reqwest::Error) -> Self {
        OsrmError::Http(err)
    }
}

impl From<OsrmError> for RouteError {
    fn from(err: OsrmError) -> Self {
        match err {
            OsrmError::Http(err) => RouteError::Transport(err.to_string()),
            OsrmError::Status(status) if status >= 500 => {
                RouteError::Transport(format!("HTTP {status}"))
            }
            OsrmError::Status(status) => RouteError::Rejected(format!("HTTP {status}")),
            OsrmError::Json(err) => RouteError::Malformed(err.to_string()),
            OsrmError::Api(code) if code == "NoRoute" => RouteError::NoRoute,
            OsrmError::Api(code) => RouteError::Rejected(code),
            OsrmError::NoRoute => RouteError::NoRoute,
        }
    }
}
