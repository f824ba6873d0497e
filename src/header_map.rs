/// A source of a `Content-Type` value, implemented for `http::HeaderMap` so
/// `expect_multipart` can work against any header type a caller already has
/// on hand.
pub trait ContentTypeSource {
    fn content_type(&self) -> Option<&str>;
}

impl ContentTypeSource for http::header::HeaderMap {
    fn content_type(&self) -> Option<&str> {
        self.get(http::header::CONTENT_TYPE)
            .and_then(|hv| hv.to_str().ok())
    }
}
