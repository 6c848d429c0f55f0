/// Coordinate reference systems the `GeometryTransform` stage can reproject between.
///
/// Every transform goes through geographic WGS84 longitude/latitude. UTM zones use the
/// WGS84 ellipsoid for both the `EPSG:326xx`/`EPSG:327xx` and the ETRS89 `EPSG:258xx`
/// codes; the GRS80 and ETRS89 offsets are well under a meter and are ignored.
use crate::runtime::payload::Crs;
use anyhow::Result;
use std::f64::consts::PI;

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

const UTM_SCALE: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;
const UTM_MIN_LATITUDE: f64 = -80.0;
const UTM_MAX_LATITUDE: f64 = 84.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// `EPSG:4326`
    Geographic,
    /// `EPSG:3857`, spherical
    WebMercator,
    /// Transverse Mercator zone `1..=60` of either hemisphere
    Utm { zone: u8, south: bool },
}

impl Projection {
    /// Projection of a CRS name, `None` when it is not supported
    pub fn of(crs: &Crs) -> Option<Projection> {
        let code = crs.epsg()?;
        match code {
            4326 => Some(Projection::Geographic),
            3857 => Some(Projection::WebMercator),
            32601..=32660 => Some(Projection::Utm { zone: (code - 32600) as u8, south: false }),
            32701..=32760 => Some(Projection::Utm { zone: (code - 32700) as u8, south: true }),
            25828..=25838 => Some(Projection::Utm { zone: (code - 25800) as u8, south: false }),
            _ => None,
        }
    }

    pub fn unproject(self, x: f64, y: f64) -> Result<(f64, f64)> {
        match self {
            Projection::Geographic => Ok((x, y)),
            Projection::WebMercator => {
                let lon = (x / SEMI_MAJOR_AXIS).to_degrees();
                let lat = (2.0 * (y / SEMI_MAJOR_AXIS).exp().atan() - PI / 2.0).to_degrees();
                Ok((lon, lat))
            }
            Projection::Utm { zone, south } => Ok(utm_to_lonlat(x, y, zone, south)),
        }
    }

    pub fn project(self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        match self {
            Projection::Geographic => Ok((lon, lat)),
            Projection::WebMercator => {
                if !(-MAX_MERCATOR_LATITUDE..=MAX_MERCATOR_LATITUDE).contains(&lat) {
                    anyhow::bail!("latitude {} is outside the Web Mercator range", lat);
                }
                let x = SEMI_MAJOR_AXIS * lon.to_radians();
                let y = SEMI_MAJOR_AXIS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
                Ok((x, y))
            }
            Projection::Utm { zone, south } => {
                if !(UTM_MIN_LATITUDE..=UTM_MAX_LATITUDE).contains(&lat) {
                    anyhow::bail!("latitude {} is outside the UTM range", lat);
                }
                Ok(lonlat_to_utm(lon, lat, zone, south))
            }
        }
    }
}

fn central_meridian(zone: u8) -> f64 {
    (f64::from(zone) * 6.0 - 183.0).to_radians()
}

fn eccentricity_squared() -> f64 {
    FLATTENING * (2.0 - FLATTENING)
}

/// Meridian arc length from the equator to `phi`
fn meridian_arc(phi: f64) -> f64 {
    let e2 = eccentricity_squared();
    let (e4, e6) = (e2 * e2, e2 * e2 * e2);
    SEMI_MAJOR_AXIS
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn lonlat_to_utm(lon: f64, lat: f64, zone: u8, south: bool) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let (sin, cos, tan) = (phi.sin(), phi.cos(), phi.tan());

    let n = SEMI_MAJOR_AXIS / (1.0 - e2 * sin * sin).sqrt();
    let t = tan * tan;
    let c = ep2 * cos * cos;
    let a = cos * (lon.to_radians() - central_meridian(zone));

    let x = UTM_SCALE
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0 + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let y = UTM_SCALE
        * (meridian_arc(phi)
            + n * tan
                * (a * a / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    (x, if south { y + UTM_FALSE_NORTHING_SOUTH } else { y })
}

fn utm_to_lonlat(x: f64, y: f64, zone: u8, south: bool) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let (e4, e6) = (e2 * e2, e2 * e2 * e2);
    let x = x - UTM_FALSE_EASTING;
    let y = if south { y - UTM_FALSE_NORTHING_SOUTH } else { y };

    // Footpoint latitude
    let mu = y / UTM_SCALE / (SEMI_MAJOR_AXIS * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin, cos, tan) = (phi1.sin(), phi1.cos(), phi1.tan());
    let n1 = SEMI_MAJOR_AXIS / (1.0 - e2 * sin * sin).sqrt();
    let t1 = tan * tan;
    let c1 = ep2 * cos * cos;
    let r1 = SEMI_MAJOR_AXIS * (1.0 - e2) / (1.0 - e2 * sin * sin).powf(1.5);
    let d = x / (n1 * UTM_SCALE);

    let phi = phi1
        - (n1 * tan / r1)
            * (d * d / 2.0 - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1) * d.powi(6) / 720.0);
    let lambda = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5) / 120.0)
            / cos;
    (lambda.to_degrees(), phi.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: (f64, f64), expected: (f64, f64), tolerance: f64) -> bool {
        (actual.0 - expected.0).abs() < tolerance && (actual.1 - expected.1).abs() < tolerance
    }

    #[test]
    fn epsg_codes_map_to_projections() {
        assert_eq!(Projection::of(&Crs::parse("EPSG:4326")), Some(Projection::Geographic));
        assert_eq!(Projection::of(&Crs::parse("3857")), Some(Projection::WebMercator));
        assert_eq!(Projection::of(&Crs::parse("EPSG:25830")), Some(Projection::Utm { zone: 30, south: false }));
        assert_eq!(Projection::of(&Crs::parse("EPSG:32756")), Some(Projection::Utm { zone: 56, south: true }));
        assert_eq!(Projection::of(&Crs::parse("EPSG:2154")), None);
        assert_eq!(Projection::of(&Crs::parse("not-a-crs")), None);
    }

    #[test]
    fn utm_matches_known_grid_positions() {
        let madrid = Projection::Utm { zone: 30, south: false }.project(-3.7038, 40.4168).unwrap();
        assert!(close(madrid, (440_290.458, 4_474_257.382), 0.01), "{:?}", madrid);

        let sydney = Projection::Utm { zone: 56, south: true }.project(151.2093, -33.8688).unwrap();
        assert!(close(sydney, (334_368.634, 6_250_948.345), 0.01), "{:?}", sydney);

        let origin = Projection::Utm { zone: 30, south: false }.project(-3.0, 0.0).unwrap();
        assert!(close(origin, (500_000.0, 0.0), 1e-6));
    }

    #[test]
    fn utm_inverse_recovers_the_position() {
        for (projection, lonlat) in [
            (Projection::Utm { zone: 30, south: false }, (-3.7038, 40.4168)),
            (Projection::Utm { zone: 56, south: true }, (151.2093, -33.8688)),
        ] {
            let (x, y) = projection.project(lonlat.0, lonlat.1).unwrap();
            let back = projection.unproject(x, y).unwrap();
            assert!(close(back, lonlat, 1e-6), "{:?}", back);
        }
    }

    #[test]
    fn out_of_range_latitudes_are_rejected() {
        assert!(Projection::WebMercator.project(0.0, 89.9).is_err());
        assert!(Projection::Utm { zone: 31, south: false }.project(2.0, 86.0).is_err());
    }
}
