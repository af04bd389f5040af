use std::net::IpAddr;

use tracing::warn;

use crate::error::AppError;

/// Platforms the downloader knows how to acquire audio from. Matching is by
/// host suffix so subdomains (www, m, music) are covered.
const SUPPORTED_PLATFORMS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "soundcloud.com",
    "twitch.tv",
];

fn host_matches(host: &str, platform: &str) -> bool {
    host.eq_ignore_ascii_case(platform)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{platform}"))
}

/// Validates a submission URL before any job is enqueued or any download is
/// attempted: http(s) scheme, a host, and a supported platform.
pub fn ensure_supported_source_url(raw: &str) -> Result<url::Url, AppError> {
    let url = url::Url::parse(raw)
        .map_err(|_| AppError::Validation("Invalid media URL".to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(%url, %scheme, "Rejected media URL due to unsupported scheme");
            return Err(AppError::Validation(
                "Unsupported URL scheme for media download".to_string(),
            ));
        }
    }

    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected media URL missing host");
        return Err(AppError::Validation(
            "URL is missing a host component".to_string(),
        ));
    };

    if !SUPPORTED_PLATFORMS
        .iter()
        .any(|platform| host_matches(host, platform))
    {
        warn!(%url, host, "Rejected media URL from unsupported platform");
        return Err(AppError::Validation(format!(
            "Unsupported video platform: {host}"
        )));
    }

    Ok(url)
}

/// Validates a caller-supplied webhook URL. The callback POST originates
/// from inside the deployment, so loopback and private ranges are rejected.
pub fn ensure_callback_url_allowed(raw: &str) -> Result<url::Url, AppError> {
    let url = url::Url::parse(raw)
        .map_err(|_| AppError::Validation("Invalid callback URL".to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(%url, %scheme, "Rejected callback URL due to unsupported scheme");
            return Err(AppError::Validation(
                "Unsupported callback URL scheme".to_string(),
            ));
        }
    }

    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected callback URL missing host");
        return Err(AppError::Validation(
            "Callback URL is missing a host component".to_string(),
        ));
    };

    if host.eq_ignore_ascii_case("localhost") {
        warn!(%url, host, "Rejected callback URL to localhost");
        return Err(AppError::Validation(
            "Callback URL host is not allowed".to_string(),
        ));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        let is_disallowed = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
        };

        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_disallowed {
            warn!(%url, host, %ip, "Rejected callback URL pointing to restricted network range");
            return Err(AppError::Validation(
                "Callback URL host is not allowed".to_string(),
            ));
        }
    }

    Ok(url)
}
