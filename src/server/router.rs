//! Per-method dispatch for plain HTTP requests sharing the listener with
//! the WebSocket services.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Response, StatusCode, Uri};
use log::error;

pub type Body = http_body_util::Full<Bytes>;

/// A plain HTTP request, with its body already read off the wire.
#[derive(Debug, Clone)]
pub struct HttpContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: SocketAddr,
    /// Identity established by the authentication gate, if any.
    pub identity: Option<String>,
}

pub type HttpHandler =
    Arc<dyn Fn(HttpContext) -> BoxFuture<'static, anyhow::Result<Response<Body>>> + Send + Sync>;

/// One handler slot per request method. An empty slot answers 501; a
/// failing or panicking handler answers 500, so every dispatched request
/// gets a response.
#[derive(Clone, Default)]
pub struct HttpRouter {
    get: Option<HttpHandler>,
    head: Option<HttpHandler>,
    post: Option<HttpHandler>,
    put: Option<HttpHandler>,
    delete: Option<HttpHandler>,
    options: Option<HttpHandler>,
    trace: Option<HttpHandler>,
    connect: Option<HttpHandler>,
    patch: Option<HttpHandler>,
}

impl HttpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response<Body>>> + Send + 'static,
    {
        let handler: HttpHandler = Arc::new(move |ctx| handler(ctx).boxed());
        match method.as_str() {
            "GET" => self.get = Some(handler),
            "HEAD" => self.head = Some(handler),
            "POST" => self.post = Some(handler),
            "PUT" => self.put = Some(handler),
            "DELETE" => self.delete = Some(handler),
            "OPTIONS" => self.options = Some(handler),
            "TRACE" => self.trace = Some(handler),
            "CONNECT" => self.connect = Some(handler),
            "PATCH" => self.patch = Some(handler),
            other => error!("no handler slot for method {}", other),
        }
        self
    }

    pub fn on_get<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response<Body>>> + Send + 'static,
    {
        self.on(Method::GET, handler)
    }

    pub fn on_post<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response<Body>>> + Send + 'static,
    {
        self.on(Method::POST, handler)
    }

    pub fn on_put<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response<Body>>> + Send + 'static,
    {
        self.on(Method::PUT, handler)
    }

    pub fn on_delete<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response<Body>>> + Send + 'static,
    {
        self.on(Method::DELETE, handler)
    }

    fn slot(&self, method: &Method) -> Option<&HttpHandler> {
        match method.as_str() {
            "GET" => self.get.as_ref(),
            "HEAD" => self.head.as_ref(),
            "POST" => self.post.as_ref(),
            "PUT" => self.put.as_ref(),
            "DELETE" => self.delete.as_ref(),
            "OPTIONS" => self.options.as_ref(),
            "TRACE" => self.trace.as_ref(),
            "CONNECT" => self.connect.as_ref(),
            "PATCH" => self.patch.as_ref(),
            _ => None,
        }
    }

    pub(crate) async fn dispatch(&self, ctx: HttpContext) -> Response<Body> {
        let Some(handler) = self.slot(&ctx.method) else {
            return status_only(StatusCode::NOT_IMPLEMENTED);
        };
        match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("http handler failed: {:#}", e);
                status_only(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(_) => {
                error!("http handler panicked");
                status_only(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(status.canonical_reason().unwrap_or_default()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(method: Method) -> HttpContext {
        HttpContext {
            method,
            uri: "/status".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: "127.0.0.1:1234".parse().unwrap(),
            identity: None,
        }
    }

    #[tokio::test]
    async fn empty_slot_answers_501() {
        let router = HttpRouter::new();
        let response = router.dispatch(ctx(Method::GET)).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn handler_response_passes_through() {
        let router = HttpRouter::new().on_get(|ctx| async move {
            Ok(Response::new(Body::from(format!("hello {}", ctx.peer_addr))))
        });
        let response = router.dispatch(ctx(Method::GET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        // Another method is still unimplemented.
        let response = router.dispatch(ctx(Method::POST)).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn failing_handler_answers_500() {
        let router = HttpRouter::new()
            .on_post(|_| async { Err(anyhow::anyhow!("backend down")) });
        let response = router.dispatch(ctx(Method::POST)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    async fn exploding(_: HttpContext) -> anyhow::Result<Response<Body>> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_answers_500() {
        let router = HttpRouter::new().on_get(exploding);
        let response = router.dispatch(ctx(Method::GET)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
