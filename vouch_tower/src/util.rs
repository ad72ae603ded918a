//! Utilities for generating HTTP responses on authentication failures

use http::{header, HeaderValue, Response, StatusCode};

const INVALID_TOKEN: &str = r#"Bearer error="invalid_token""#;

/// Build a `401 Unauthorized` response with the appropriate `www-authenticate`
/// header
///
/// The description provided will be automatically escaped to make sure it
/// is header-friendly.
///
/// The prepared response will have the form:
///
/// ```http
/// HTTP/1.1 401 Unauthorized
/// www-authenticate: Bearer error="invalid_token" error_description="{description}"
/// ```
///
/// `error_description` is omitted if `description` is empty.
pub fn unauthorized<Body: Default>(description: &str) -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, invalid_token(description));
    resp
}

fn invalid_token(description: &str) -> HeaderValue {
    if description.is_empty() {
        return HeaderValue::from_static(INVALID_TOKEN);
    }

    let value = format!(
        r#"{INVALID_TOKEN} error_description="{}""#,
        description.escape_default()
    );

    HeaderValue::try_from(value).unwrap_or_else(|_| HeaderValue::from_static(INVALID_TOKEN))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn unicode_and_non_printing_description_is_escaped() {
        let resp = unauthorized::<()>(
            "\0\n\ttest™: \"Ĉu oni povas bone ŝanĝi ĉi tiu mesaĝon en respondon?\"",
        );

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([
            r#"Bearer error="invalid_token" error_description="\u{0}\n\ttest\u{2122}: \"\u{108}u oni povas bone \u{15d}an\u{11d}i \u{109}i tiu mesa\u{11d}on en respondon?\"""#,
        ]);

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(headers, expected);
    }

    #[test]
    fn empty_description_is_omitted() {
        let resp = unauthorized::<()>("");

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([r#"Bearer error="invalid_token""#]);

        assert_eq!(headers, expected);
    }

    #[test]
    fn body_is_the_default_for_its_type() {
        let resp = unauthorized::<String>("token expired");

        assert!(resp.body().is_empty());
        assert_eq!(
            extract_www_authenticate_headers(&resp),
            BTreeSet::from([r#"Bearer error="invalid_token" error_description="token expired""#])
        );
    }

    fn extract_www_authenticate_headers<B>(resp: &Response<B>) -> BTreeSet<&str> {
        resp.headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect::<BTreeSet<_>>()
    }
}
