//! Axum adapter for the session transport boundary.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode, Uri,
        header::SET_COOKIE,
        request::Parts,
    },
    response::{IntoResponse, IntoResponseParts, Response, ResponseParts},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite as CookieSameSite};
use sessionist_core::{CookieExpiry, SameSite, SessionCookie, Transport};
use time::OffsetDateTime;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid header name: {0:?}")]
    HeaderName(String),
    #[error("Invalid value for header {0}")]
    HeaderValue(String),
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Failed to write session headers");
        (StatusCode::INTERNAL_SERVER_ERROR, "session transport error").into_response()
    }
}

#[derive(Debug, Clone)]
enum HeaderOp {
    Set(String, String),
    Remove(String),
}

/// Session transport over one HTTP exchange.
///
/// Extract it in a handler, pass it to the session manager, then return it
/// alongside the body so the queued cookies and headers reach the response:
///
/// ```ignore
/// async fn handler(State(sessions): State<Arc<SessionManager>>, mut transport: HttpTransport)
///     -> Result<(HttpTransport, String), AppError>
/// {
///     let store = sessions.start(&mut transport).await?;
///     store.release().await;
///     Ok((transport, "ok".into()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    jar: CookieJar,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    secure: bool,
    cookies_out: Vec<SessionCookie>,
    headers_out: Vec<HeaderOp>,
}

impl HttpTransport {
    /// Capture the parts of a request the session manager reads.
    #[must_use]
    pub fn new(headers: &HeaderMap, uri: &Uri) -> Self {
        let query: Vec<(String, String)> = uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            jar: CookieJar::from_headers(headers),
            query,
            headers: headers.clone(),
            secure: is_https(headers, uri),
            cookies_out: Vec::new(),
            headers_out: Vec::new(),
        }
    }

    /// Cookies queued for the response.
    #[must_use]
    pub fn outgoing_cookies(&self) -> &[SessionCookie] {
        &self.cookies_out
    }

    /// Write queued cookies and header changes into `headers`.
    ///
    /// Header changes apply in the order they were queued.
    ///
    /// # Errors
    /// Returns error if a header name or value cannot be encoded.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), TransportError> {
        for op in &self.headers_out {
            match op {
                HeaderOp::Set(name, value) => {
                    let header = header_name(name)?;
                    let value = HeaderValue::from_str(value)
                        .map_err(|_| TransportError::HeaderValue(name.clone()))?;
                    headers.insert(header, value);
                }
                HeaderOp::Remove(name) => {
                    headers.remove(header_name(name)?);
                }
            }
        }

        for cookie in &self.cookies_out {
            let rendered = render_cookie(cookie).to_string();
            let value = HeaderValue::from_str(&rendered)
                .map_err(|_| TransportError::HeaderValue(SET_COOKIE.to_string()))?;
            headers.append(SET_COOKIE, value);
        }
        Ok(())
    }
}

fn header_name(name: &str) -> Result<HeaderName, TransportError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| TransportError::HeaderName(name.to_string()))
}

fn is_https(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    headers
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn render_cookie(cookie: &SessionCookie) -> Cookie<'static> {
    let mut builder = Cookie::build((cookie.name.clone(), cookie.value.clone()))
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only);

    if let Some(domain) = &cookie.domain {
        builder = builder.domain(domain.clone());
    }
    if let Some(same_site) = cookie.same_site {
        builder = builder.same_site(match same_site {
            SameSite::Strict => CookieSameSite::Strict,
            SameSite::Lax => CookieSameSite::Lax,
            SameSite::None => CookieSameSite::None,
        });
    }
    match cookie.expiry {
        CookieExpiry::Session => {}
        CookieExpiry::Seconds(secs) => {
            builder = builder.max_age(time::Duration::seconds(
                i64::try_from(secs).unwrap_or(i64::MAX),
            ));
        }
        CookieExpiry::Expired => {
            builder = builder
                .max_age(time::Duration::ZERO)
                .expires(OffsetDateTime::UNIX_EPOCH);
        }
    }
    builder.build()
}

impl Transport for HttpTransport {
    fn cookie(&self, name: &str) -> Option<String> {
        self.jar.get(name).map(|c| c.value().to_string())
    }

    fn query(&self, name: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn set_cookie(&mut self, cookie: SessionCookie) {
        self.cookies_out.retain(|queued| queued.name != cookie.name);
        self.cookies_out.push(cookie);
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers_out
            .push(HeaderOp::Set(name.to_string(), value.to_string()));
    }

    fn remove_header(&mut self, name: &str) {
        self.headers_out.push(HeaderOp::Remove(name.to_string()));
    }
}

impl<S> FromRequestParts<S> for HttpTransport
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::new(&parts.headers, &parts.uri))
    }
}

impl IntoResponseParts for HttpTransport {
    type Error = TransportError;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        self.apply(res.headers_mut())?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        Router,
        body::Body,
        extract::State,
        http::{Request, header::COOKIE},
        routing::get,
    };
    use sessionist::{ManagerConfig, ProviderRegistry, SessionManager};
    use tower::ServiceExt;

    use super::*;

    fn transport(uri: &str, headers: &[(&'static str, &str)]) -> HttpTransport {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        HttpTransport::new(&map, &uri.parse().unwrap())
    }

    fn cookie(expiry: CookieExpiry) -> SessionCookie {
        SessionCookie {
            name: "sid".to_string(),
            value: "abc".to_string(),
            path: "/".to_string(),
            domain: Some("example.com".to_string()),
            expiry,
            secure: true,
            http_only: true,
            same_site: Some(SameSite::Lax),
        }
    }

    #[test]
    fn test_reads_cookie_query_and_header() {
        let t = transport(
            "/page?x=1&sid=q%20v",
            &[("cookie", "theme=dark; sid=abc"), ("x-session-id", "h1")],
        );
        assert_eq!(t.cookie("sid").as_deref(), Some("abc"));
        assert_eq!(t.cookie("missing"), None);
        assert_eq!(t.query("sid").as_deref(), Some("q v"));
        assert_eq!(t.query("y"), None);
        assert_eq!(t.header("X-Session-Id").as_deref(), Some("h1"));
    }

    #[test]
    fn test_https_detection() {
        assert!(transport("https://example.com/", &[]).is_secure());
        assert!(transport("/", &[("x-forwarded-proto", "HTTPS")]).is_secure());
        assert!(!transport("/", &[("x-forwarded-proto", "http, https")]).is_secure());
        assert!(!transport("http://example.com/", &[]).is_secure());
    }

    #[test]
    fn test_render_persistent_cookie() {
        let rendered = render_cookie(&cookie(CookieExpiry::Seconds(600))).to_string();
        assert!(rendered.starts_with("sid=abc"));
        for part in [
            "Max-Age=600",
            "Path=/",
            "Domain=example.com",
            "HttpOnly",
            "Secure",
            "SameSite=Lax",
        ] {
            assert!(rendered.contains(part), "{rendered} lacks {part}");
        }
        assert!(!rendered.contains("Expires"));
    }

    #[test]
    fn test_render_expired_cookie() {
        let rendered = render_cookie(&cookie(CookieExpiry::Expired)).to_string();
        assert!(rendered.contains("Max-Age=0"));
        assert!(rendered.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn test_browser_session_cookie_has_no_max_age() {
        let rendered = render_cookie(&cookie(CookieExpiry::Session)).to_string();
        assert!(!rendered.contains("Max-Age"));
    }

    #[test]
    fn test_apply_writes_headers_in_order() {
        let mut t = transport("/", &[]);
        t.set_header("X-Session-Id", "one");
        t.remove_header("X-Session-Id");
        t.set_header("X-Other", "two");
        t.set_cookie(cookie(CookieExpiry::Session));

        let mut headers = HeaderMap::new();
        t.apply(&mut headers).unwrap();
        assert!(headers.get("x-session-id").is_none());
        assert_eq!(headers.get("x-other").unwrap(), "two");
        assert_eq!(headers.get_all(SET_COOKIE).iter().count(), 1);
    }

    #[test]
    fn test_later_cookie_replaces_queued_one() {
        let mut t = transport("/", &[]);
        t.set_cookie(cookie(CookieExpiry::Session));
        t.set_cookie(cookie(CookieExpiry::Expired));
        assert_eq!(t.outgoing_cookies().len(), 1);
        assert_eq!(t.outgoing_cookies()[0].expiry, CookieExpiry::Expired);
    }

    #[test]
    fn test_apply_rejects_bad_header_name() {
        let mut t = transport("/", &[]);
        t.set_header("bad header", "x");
        let err = t.apply(&mut HeaderMap::new()).unwrap_err();
        assert!(matches!(err, TransportError::HeaderName(_)));
    }

    async fn visit(
        State(sessions): State<Arc<SessionManager>>,
        mut transport: HttpTransport,
    ) -> (HttpTransport, String) {
        let store = sessions.start(&mut transport).await.unwrap();
        let visits = store.get_as::<u64>("visits").unwrap_or(0) + 1;
        store.set("visits", visits);
        store.release().await;
        (transport, visits.to_string())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_router_round_trip() {
        let config = ManagerConfig::new("memory", "sid", Duration::from_secs(60));
        let sessions = SessionManager::new(config, &ProviderRegistry::with_defaults(), None)
            .await
            .unwrap();
        let app = Router::new()
            .route("/", get(visit))
            .with_state(Arc::new(sessions));

        let first = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let set_cookie = first.headers()[SET_COOKIE].to_str().unwrap().to_string();
        let pair = set_cookie.split(';').next().unwrap().to_string();
        assert!(pair.starts_with("sid="));
        assert_eq!(body_text(first).await, "1");

        let second = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(COOKIE, pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(second.headers().get(SET_COOKIE).is_none());
        assert_eq!(body_text(second).await, "2");
    }
}
