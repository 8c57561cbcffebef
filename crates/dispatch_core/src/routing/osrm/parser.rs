use tracing::debug;

use crate::routing::RouteLeg;

use super::error::OsrmError;
use super::response::OsrmRouteResponse;

pub(super) fn parse_route_response(resp: OsrmRouteResponse) -> Result<RouteLeg, OsrmError> {
    if resp.code != "Ok" {
        if let Some(message) = &resp.message {
            debug!(code = %resp.code, %message, "OSRM refused route");
        }
        return Err(OsrmError::Api(resp.code));
    }

    let route = resp
        .routes
        .and_then(|routes| routes.into_iter().next())
        .ok_or(OsrmError::NoRoute)?;
    if !route.distance.is_finite() || !route.duration.is_finite() {
        return Err(OsrmError::NoRoute);
    }

    Ok(RouteLeg {
        distance_m: route.distance.max(0.0),
        duration_s: route.duration.max(0.0),
        polyline: route.geometry.unwrap_or_default(),
    })
}
