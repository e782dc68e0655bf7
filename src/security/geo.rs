//! Geo lookup and region blocking.
//!
//! Lookups go through a CIDR table loaded from configuration and swapped
//! whole on reload; the most specific matching prefix wins. Addresses with
//! no match have no location and are never region-blocked.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GeoEntryConfig;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// IP → location.
pub trait GeoLookup: Send + Sync + std::fmt::Debug {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("missing prefix length")]
    MissingPrefix,
    #[error("invalid address: {0}")]
    Address(String),
    #[error("prefix length {0} out of range")]
    PrefixLength(u8),
}

/// An address block such as `203.0.113.0/24` or `2001:db8::/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.trim().split_once('/').ok_or(CidrError::MissingPrefix)?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| CidrError::Address(addr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::Address(s.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(CidrError::PrefixLength(prefix));
        }
        Ok(Self { network, prefix })
    }
}

/// CIDR → location table from configuration, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticGeoTable {
    entries: ArcSwap<Vec<(Cidr, GeoLocation)>>,
}

impl StaticGeoTable {
    pub fn from_config(entries: &[GeoEntryConfig]) -> Result<Self, CidrError> {
        Ok(Self {
            entries: ArcSwap::from_pointee(build_table(entries)?),
        })
    }

    /// Swap in a new table. The old one stays in place if any entry is invalid.
    pub fn replace(&self, entries: &[GeoEntryConfig]) -> Result<(), CidrError> {
        self.entries.store(Arc::new(build_table(entries)?));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

fn build_table(entries: &[GeoEntryConfig]) -> Result<Vec<(Cidr, GeoLocation)>, CidrError> {
    let mut table = Vec::with_capacity(entries.len());
    for entry in entries {
        table.push((
            entry.cidr.parse::<Cidr>()?,
            GeoLocation {
                country: entry.country.to_ascii_uppercase(),
                latitude: entry.latitude,
                longitude: entry.longitude,
            },
        ));
    }
    // most specific first so the first hit is the longest prefix
    table.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));
    Ok(table)
}

impl GeoLookup for StaticGeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.entries
            .load()
            .iter()
            .find(|(cidr, _)| cidr.contains(ip))
            .map(|(_, location)| location.clone())
    }
}

/// Refuses requests from configured countries.
#[derive(Debug, Default)]
pub struct RegionFilter {
    blocked: HashSet<String>,
}

impl RegionFilter {
    pub fn new(regions: &[String]) -> Self {
        Self {
            blocked: regions.iter().map(|r| r.trim().to_ascii_uppercase()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// The blocked country for `ip`, if any.
    pub fn blocked_country(&self, geo: &dyn GeoLookup, ip: IpAddr) -> Option<String> {
        if self.blocked.is_empty() {
            return None;
        }
        geo.lookup(ip)
            .map(|location| location.country)
            .filter(|country| self.blocked.contains(country))
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cidr: &str, country: &str, lat: f64, lon: f64) -> GeoEntryConfig {
        GeoEntryConfig {
            cidr: cidr.into(),
            country: country.into(),
            latitude: lat,
            longitude: lon,
        }
    }

    #[test]
    fn cidr_parsing() {
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.200.1.1".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let v6: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains("2001:db8:1::5".parse().unwrap()));

        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("198.51.100.7".parse().unwrap()));

        assert_eq!("10.0.0.0".parse::<Cidr>(), Err(CidrError::MissingPrefix));
        assert_eq!("10.0.0.0/40".parse::<Cidr>(), Err(CidrError::PrefixLength(40)));
        assert!("nope/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = StaticGeoTable::from_config(&[
            entry("203.0.0.0/8", "au", -33.8, 151.2),
            entry("203.0.113.0/24", "jp", 35.7, 139.7),
        ])
        .unwrap();
        assert_eq!(table.lookup("203.0.113.9".parse().unwrap()).unwrap().country, "JP");
        assert_eq!(table.lookup("203.1.1.1".parse().unwrap()).unwrap().country, "AU");
        assert!(table.lookup("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn region_filter_blocks_listed_countries_only() {
        let table = StaticGeoTable::from_config(&[entry("198.51.100.0/24", "KP", 39.0, 125.7)]).unwrap();
        let filter = RegionFilter::new(&["kp".to_string()]);
        assert_eq!(
            filter.blocked_country(&table, "198.51.100.3".parse().unwrap()),
            Some("KP".to_string())
        );
        assert_eq!(filter.blocked_country(&table, "192.0.2.1".parse().unwrap()), None);
    }

    #[test]
    fn replace_swaps_whole_table() {
        let table = StaticGeoTable::from_config(&[entry("203.0.113.0/24", "US", 40.7, -74.0)]).unwrap();
        let ip = "203.0.113.7".parse().unwrap();
        assert_eq!(table.lookup(ip).unwrap().country, "US");

        table.replace(&[entry("203.0.113.0/24", "ru", 55.75, 37.6)]).unwrap();
        assert_eq!(table.lookup(ip).unwrap().country, "RU");

        // an invalid table leaves the current one in place
        assert!(table.replace(&[entry("203.0.113.0", "DE", 52.5, 13.4)]).is_err());
        assert_eq!(table.lookup(ip).unwrap().country, "RU");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn haversine_known_distance() {
        // London → New York is roughly 5570 km
        let d = haversine_km(51.5074, -0.1278, 40.7128, -74.0060);
        assert!((d - 5570.0).abs() < 20.0, "distance was {d}");
        assert_eq!(haversine_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }
}
