use std::time::Duration;

use reqwest::{blocking::Client, Url};

use crate::geo::GeoPoint;
use crate::routing::{RouteError, RouteLeg, RouteProvider};

use super::error::OsrmError;
use super::parser::parse_route_response;
use super::response::OsrmRouteResponse;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Routes via an OSRM HTTP endpoint.
#[derive(Debug, Clone)]
pub struct OsrmRouteProvider {
    client: Client,
    endpoint: String,
}

impl OsrmRouteProvider {
    /// Create a provider for the given endpoint (e.g. `http://localhost:5000`).
    pub fn new(endpoint: &str) -> Result<Self, RouteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| RouteError::Transport(format!("failed to build OSRM client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub(super) fn route_url(&self, points: &[GeoPoint]) -> Result<Url, OsrmError> {
        let coords = points
            .iter()
            .map(|point| format!("{:.6},{:.6}", point.lng, point.lat))
            .collect::<Vec<_>>()
            .join(";");
        let mut url = Url::parse(&format!("{}/route/v1/driving/{}", self.endpoint, coords))
            .map_err(|err| OsrmError::Api(format!("failed to build OSRM URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("overview", "full")
            .append_pair("geometries", "polyline")
            .append_pair("steps", "false");
        Ok(url)
    }

    fn fetch(&self, points: &[GeoPoint]) -> Result<RouteLeg, OsrmError> {
        if points.len() < 2 {
            return Err(OsrmError::NoRoute);
        }
        let url = self.route_url(points)?;
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(OsrmError::Status(status.as_u16()));
        }
        let parsed: OsrmRouteResponse = response.json().map_err(OsrmError::Json)?;
        parse_route_response(parsed)
    }
}

impl RouteProvider for OsrmRouteProvider {
    fn route(&self, points: &[GeoPoint]) -> Result<RouteLeg, RouteError> {
        self.fetch(points).map_err(RouteError::from)
    }
}
