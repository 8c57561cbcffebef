use crate::geo::GeoPoint;
use crate::routing::RouteError;

use super::client::OsrmRouteProvider;
use super::error::OsrmError;
use super::parser::parse_route_response;
use super::response::{OsrmRoute, OsrmRouteResponse};

#[test]
fn parses_first_route() {
    let resp = OsrmRouteResponse {
        code: "Ok".into(),
        message: None,
        routes: Some(vec![
            OsrmRoute {
                distance: 4_210.5,
                duration: 512.0,
                geometry: Some("_p~iF~ps|U_ulLnnqC".into()),
            },
            OsrmRoute {
                distance: 9_000.0,
                duration: 900.0,
                geometry: None,
            },
        ]),
    };
    let leg = parse_route_response(resp).expect("route");
    assert_eq!(leg.distance_m, 4_210.5);
    assert_eq!(leg.duration_s, 512.0);
    assert_eq!(leg.polyline, "_p~iF~ps|U_ulLnnqC");
}

#[test]
fn non_ok_code_is_an_api_error() {
    let resp = OsrmRouteResponse {
        code: "NoRoute".into(),
        message: Some("Impossible route between points".into()),
        routes: None,
    };
    let err = parse_route_response(resp).unwrap_err();
    assert!(matches!(err, OsrmError::Api(ref code) if code == "NoRoute"));
    assert!(matches!(RouteError::from(err), RouteError::NoRoute));
}

#[test]
fn empty_routes_is_no_route() {
    let resp = OsrmRouteResponse {
        code: "Ok".into(),
        message: None,
        routes: Some(Vec::new()),
    };
    assert!(matches!(
        parse_route_response(resp),
        Err(OsrmError::NoRoute)
    ));
}

#[test]
fn server_errors_are_transient_client_errors_are_not() {
    assert!(RouteError::from(OsrmError::Status(503)).is_transient());
    assert!(!RouteError::from(OsrmError::Status(400)).is_transient());
}

#[test]
fn url_lists_coordinates_lng_first() {
    let provider = OsrmRouteProvider::new("http://localhost:5000/").expect("client");
    let url = provider
        .route_url(&[
            GeoPoint::new(52.52, 13.405),
            GeoPoint::new(52.5, 13.45),
        ])
        .expect("url");
    assert!(url
        .as_str()
        .starts_with("http://localhost:5000/route/v1/driving/13.405000,52.520000;13.450000,52.500000?"));
    assert!(url.as_str().contains("geometries=polyline"));
}
