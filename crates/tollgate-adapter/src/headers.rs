/// Outbound header list. A plain vector keeps insertion order and avoids a
/// dependency on any concrete HTTP client's header map.
pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let lowered = name.to_ascii_lowercase();
    headers.retain(|(k, _)| k.to_ascii_lowercase() != lowered);
    headers.push((name.to_string(), value.into()));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let lowered = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == lowered)
        .map(|(_, v)| v.as_str())
}

pub fn set_bearer(headers: &mut Headers, api_key: &str) {
    header_set(headers, "authorization", format!("Bearer {api_key}"));
}

pub fn set_accept_json(headers: &mut Headers) {
    header_set(headers, "accept", "application/json");
}

pub fn set_content_type_json(headers: &mut Headers) {
    header_set(headers, "content-type", "application/json");
}
