//! JA4H: a fingerprint of how a client shapes its HTTP request.

use hyper::header::{ACCEPT_LANGUAGE, COOKIE, REFERER};
use hyper::{Request, Version};
use sha2::{Digest, Sha256};

fn hash12(input: &str) -> String {
    if input.is_empty() {
        return "000000000000".to_string();
    }
    hex::encode(Sha256::digest(input.as_bytes()))[..12].to_string()
}

fn version_code(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "09",
        Version::HTTP_10 => "10",
        Version::HTTP_11 => "11",
        Version::HTTP_2 => "20",
        Version::HTTP_3 => "30",
        _ => "00",
    }
}

fn language_code<B>(req: &Request<B>) -> String {
    let Some(value) = req
        .headers()
        .get(ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
    else {
        return "0000".to_string();
    };

    let normalized = value.replace('-', "").replace(';', ",").to_lowercase();
    let first = normalized.split(',').next().unwrap_or_default().trim();
    let mut code: String = first.chars().take(4).collect();
    while code.len() < 4 {
        code.push('0');
    }
    code
}

fn cookies<B>(req: &Request<B>) -> Vec<(String, String)> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let pair = pair.trim();
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (!name.is_empty()).then(|| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `<method><version><cookie><referer><count><lang>_<headers>_<cookie names>_<cookies>`
pub fn ja4h<B>(req: &Request<B>) -> String {
    let method = req.method().as_str().to_lowercase();
    let mut method: String = method.chars().take(2).collect();
    while method.len() < 2 {
        method.push('0');
    }

    let headers = req.headers();
    let names: Vec<&str> = headers
        .keys()
        .map(|k| k.as_str())
        .filter(|k| *k != COOKIE.as_str() && *k != REFERER.as_str())
        .collect();

    let a = format!(
        "{}{}{}{}{:02}{}",
        method,
        version_code(req.version()),
        if headers.contains_key(COOKIE) { 'c' } else { 'n' },
        if headers.contains_key(REFERER) { 'r' } else { 'n' },
        names.len().min(99),
        language_code(req),
    );

    let mut cookies = cookies(req);
    cookies.sort();
    let mut cookie_names: Vec<&str> = cookies.iter().map(|(n, _)| n.as_str()).collect();
    cookie_names.sort_unstable();
    let cookie_pairs: Vec<String> = cookies.iter().map(|(n, v)| format!("{n}={v}")).collect();

    format!(
        "{}_{}_{}_{}",
        a,
        hash12(&names.join(",")),
        hash12(&cookie_names.join(",")),
        hash12(&cookie_pairs.join(","))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ja4h_prefix() {
        let req = Request::builder()
            .method("GET")
            .uri("/")
            .header("host", "a.example")
            .header("user-agent", "curl/8.0")
            .header("accept-language", "en-US,en;q=0.9")
            .header("cookie", "b=2; a=1")
            .header("referer", "https://a.example/")
            .body(())
            .unwrap();

        let fp = ja4h(&req);
        let parts: Vec<&str> = fp.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ge11cr03enus");
        assert_eq!(parts[1], hash12("host,user-agent,accept-language"));
        assert_eq!(parts[2], hash12("a,b"));
        assert_eq!(parts[3], hash12("a=1,b=2"));
    }

    #[test]
    fn test_ja4h_minimal_request() {
        let req = Request::builder()
            .method("POST")
            .version(Version::HTTP_2)
            .uri("/")
            .body(())
            .unwrap();

        assert_eq!(
            ja4h(&req),
            "po20nn000000_000000000000_000000000000_000000000000"
        );
    }

    #[test]
    fn test_language_padding() {
        let req = Request::builder()
            .header("accept-language", "de")
            .body(())
            .unwrap();
        assert_eq!(language_code(&req), "de00");
    }
}
