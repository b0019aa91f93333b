//! Translation between the two request-line conventions spoken at service
//! boundaries, plus configured header injection.
//!
//! Incoming connections under host style carry origin-form request lines
//! with the authority in `Host`; internally every request travels in
//! absolute form. Outgoing host-style requests are translated back. Proxy
//! style passes absolute request lines through untouched.

use crate::config::{HttpOptionsConf, HttpStyle};
use crate::error::Error;
use crate::headers::{HeaderId, HeaderInjector, HeaderTable, HeaderTableBuilder};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{header, HeaderMap, HeaderValue, Request};

pub struct HttpRewriter {
    style: HttpStyle,
    forwarded_proto_header: Option<HeaderId>,
    cf_blob_header: Option<HeaderId>,
    request_injector: HeaderInjector,
    response_injector: HeaderInjector,
    table: HeaderTable,
}

impl HttpRewriter {
    /// Must be called while the header table is still building; ids for the
    /// configured headers are allocated here.
    pub fn new(options: &HttpOptionsConf, builder: &HeaderTableBuilder) -> Result<Self, Error> {
        let forwarded_proto_header = options
            .forwarded_proto_header
            .as_deref()
            .map(|name| builder.add(name))
            .transpose()?;
        let cf_blob_header = options
            .cf_blob_header
            .as_deref()
            .map(|name| builder.add(name))
            .transpose()?;
        let request_injector = HeaderInjector::new(
            options
                .inject_request_headers
                .iter()
                .map(|h| (h.name.as_str(), h.value.as_deref())),
            builder,
        )?;
        let response_injector = HeaderInjector::new(
            options
                .inject_response_headers
                .iter()
                .map(|h| (h.name.as_str(), h.value.as_deref())),
            builder,
        )?;

        Ok(Self {
            style: options.style,
            forwarded_proto_header,
            cf_blob_header,
            request_injector,
            response_injector,
            table: builder.future_table(),
        })
    }

    pub fn has_cf_blob_header(&self) -> bool {
        self.cf_blob_header.is_some()
    }

    pub fn needs_rewrite_request(&self) -> bool {
        self.style == HttpStyle::Host
            || self.cf_blob_header.is_some()
            || !self.request_injector.is_empty()
    }

    pub fn needs_rewrite_response(&self) -> bool {
        !self.response_injector.is_empty()
    }

    /// Rewrites a request received from a client into internal (absolute)
    /// form. Returns `None` when the request is unusable — in particular a
    /// host-style request with no `Host` header — in which case the caller
    /// responds `400 Bad Request` without touching the service.
    pub fn rewrite_incoming_request<B>(
        &self,
        req: &mut Request<B>,
        physical_protocol: &str,
        cf_blob_json: &mut Option<String>,
    ) -> Option<()> {
        if self.style == HttpStyle::Host {
            let path_and_query = req.uri().path_and_query().cloned()?;
            let authority = Authority::try_from(req.headers().get(header::HOST)?.as_bytes()).ok()?;

            // The forwarded-proto header, when configured and present, names
            // the original scheme; otherwise the transport under us does.
            let mut scheme = None;
            if let Some(id) = self.forwarded_proto_header {
                let name = self.table.name(id).clone();
                if let Some(value) = req.headers_mut().remove(&name) {
                    scheme = Some(Scheme::try_from(value.as_bytes()).ok()?);
                }
            }
            let scheme = match scheme {
                Some(scheme) => scheme,
                None => Scheme::try_from(physical_protocol).ok()?,
            };

            *req.uri_mut() = Uri::builder()
                .scheme(scheme)
                .authority(authority)
                .path_and_query(path_and_query)
                .build()
                .ok()?;
        }

        if let Some(id) = self.cf_blob_header {
            let name = self.table.name(id).clone();
            if let Some(value) = req.headers_mut().remove(&name) {
                *cf_blob_json = Some(String::from_utf8_lossy(value.as_bytes()).into_owned());
            }
        }

        self.request_injector.apply(&self.table, req.headers_mut());
        Some(())
    }

    /// Rewrites an internal (absolute-form) request for transmission to an
    /// upstream server.
    pub fn rewrite_outgoing_request<B>(
        &self,
        req: &mut Request<B>,
        cf_blob_json: Option<&str>,
    ) -> Result<(), Error> {
        if self.style == HttpStyle::Host {
            let uri = req.uri().clone();
            let authority = uri.authority().ok_or(Error::InvalidUrl)?;
            let host = HeaderValue::from_str(authority.as_str()).map_err(|_| Error::InvalidHost)?;
            req.headers_mut().insert(header::HOST, host);

            if let Some(id) = self.forwarded_proto_header {
                let scheme = uri.scheme_str().ok_or(Error::InvalidUrl)?;
                req.headers_mut()
                    .insert(self.table.name(id).clone(), HeaderValue::from_str(scheme)?);
            }

            let path_and_query = uri
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/"));
            *req.uri_mut() = Uri::builder().path_and_query(path_and_query).build()?;
        }

        if let Some(id) = self.cf_blob_header {
            let name = self.table.name(id).clone();
            match cf_blob_json {
                Some(blob) => {
                    req.headers_mut().insert(name, HeaderValue::from_str(blob)?);
                }
                None => {
                    req.headers_mut().remove(&name);
                }
            }
        }

        self.request_injector.apply(&self.table, req.headers_mut());
        Ok(())
    }

    pub fn rewrite_response(&self, headers: &mut HeaderMap) {
        self.response_injector.apply(&self.table, headers);
    }
}
