//! The two modifier interfaces consumed by the pipeline (§4, §6). Concrete
//! modifier libraries are an external collaborator; this module only
//! defines the seam.

use std::{future::Future, pin::Pin};

use http::{HeaderValue, Request, Response};

use crate::{
    context::Context,
    error::BoxError,
    wire::{RecvBody, SendBody},
};

/// What a modifier invocation asks the pipeline to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Proceed with the pipeline as normal.
    Continue,
    /// The modifier called [`Context::hijack`] and now owns the raw stream;
    /// the pipeline must return without any further read or write.
    Hijacked,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Applied to every request, including `CONNECT` (§4.3, §4.4).
pub trait RequestModifier: Send + Sync {
    fn modify_request<'a>(
        &'a self,
        ctx: &'a mut Context,
        req: &'a mut Request<RecvBody>,
    ) -> BoxFuture<'a, Result<Disposition, BoxError>>;
}

/// Applied to every response, including synthetic `200`/`502`/`407`s (§4.3,
/// §4.6).
pub trait ResponseModifier: Send + Sync {
    fn modify_response<'a>(
        &'a self,
        ctx: &'a mut Context,
        res: &'a mut Response<SendBody>,
    ) -> BoxFuture<'a, Result<Disposition, BoxError>>;
}

/// A modifier that does nothing; the default when the proxy is built
/// without one configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModifier;

impl RequestModifier for NoopModifier {
    fn modify_request<'a>(
        &'a self,
        _ctx: &'a mut Context,
        _req: &'a mut Request<RecvBody>,
    ) -> BoxFuture<'a, Result<Disposition, BoxError>> {
        Box::pin(async { Ok(Disposition::Continue) })
    }
}

impl ResponseModifier for NoopModifier {
    fn modify_response<'a>(
        &'a self,
        _ctx: &'a mut Context,
        _res: &'a mut Response<SendBody>,
    ) -> BoxFuture<'a, Result<Disposition, BoxError>> {
        Box::pin(async { Ok(Disposition::Continue) })
    }
}

/// §4.3 "attach a warning header to the request and continue": modifier
/// errors are never fatal, they're surfaced to the client as a `Warning`
/// header (§6, §7).
pub(crate) fn warn_header_value(source: &BoxError) -> HeaderValue {
    let text = format!("199 waylay \"{}\"", sanitize(&source.to_string()));
    HeaderValue::from_str(&text)
        .unwrap_or_else(|_| HeaderValue::from_static("199 waylay \"modifier error\""))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c == '"' || c.is_control() { ' ' } else { c })
        .collect()
}
