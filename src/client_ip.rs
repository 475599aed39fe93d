use std::net::{IpAddr, SocketAddr};

use actix_web::http::header::HeaderMap;

pub const UNKNOWN_CLIENT: &str = "unknown";

const CLIENT_IP_HEADER: &str = "client-ip";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

// `Client-IP`, then the first valid `X-Forwarded-For` entry, then the peer.
pub fn resolve_client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(ip) = header_str(headers, CLIENT_IP_HEADER).and_then(parse_ip) {
        return ip.to_string();
    }

    if let Some(list) = header_str(headers, FORWARDED_FOR_HEADER) {
        if let Some(ip) = list.split(',').find_map(parse_ip) {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok()
}
