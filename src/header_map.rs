/// A source of response headers, implemented for http::HeaderMap.
/// Lookups are case insensitive. Any other client stack can be plugged in by
/// implementing this for its own header type.
pub trait HeaderMap {
    fn get_value<K>(&self, header_key: K) -> Option<&str>
    where
        K: AsRef<str>;
}

impl HeaderMap for http::header::HeaderMap {
    fn get_value<K>(&self, header_key: K) -> Option<&str>
    where
        K: AsRef<str>,
    {
        self.get(header_key.as_ref())
            .and_then(|hv| hv.to_str().ok())
    }
}

impl HeaderMap for Vec<(String, String)> {
    fn get_value<K>(&self, header_key: K) -> Option<&str>
    where
        K: AsRef<str>,
    {
        let key = header_key.as_ref();
        self.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}
