//! SIP message builder utilities

use super::message::{make_header, SipHeaders, SipRequest, SipResponse};
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{generate_tag, SipMethod};
use rsip::{Header, Headers};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Tag added to To when the request carries none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut response = SipResponse::build(self.status_code);

        // Copy essential headers from request
        for via in request.header_values("Via") {
            response.push_header("Via", via);
        }
        let from = request
            .header_value("From")
            .ok_or_else(|| SipError::ProtocolViolation("Request without From".to_string()))?;
        response.push_header("From", from);
        let mut to = request
            .header_value("To")
            .ok_or_else(|| SipError::ProtocolViolation("Request without To".to_string()))?;
        if request.to_tag().is_none() {
            if let Some(tag) = &self.to_tag {
                to = format!("{};tag={}", to, tag);
            }
        }
        response.push_header("To", to);
        for name in ["Call-ID", "CSeq"] {
            let value = request
                .header_value(name)
                .ok_or_else(|| SipError::ProtocolViolation(format!("Request without {}", name)))?;
            response.push_header(name, value);
        }

        for (name, value) in self.headers {
            response.push_header(&name, value);
        }
        response.push_header("Content-Length", self.body.len().to_string());
        response.inner.body = self.body;
        Ok(response)
    }
}

/// Build a simple response for a request
pub fn build_response(request: &SipRequest, status_code: u16) -> Result<SipResponse, SipError> {
    ResponseBuilder::new(status_code).build_for_request(request)
}

/// Builder for out-of-dialog requests such as REGISTER
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    from: Option<String>,
    to: Option<String>,
    call_id: Option<String>,
    cseq: u32,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            from: None,
            to: None,
            call_id: None,
            cseq: 1,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// From address; a fresh tag is appended
    pub fn from(mut self, address: &str) -> Self {
        self.from = Some(format!("<{}>;tag={}", address, generate_tag()));
        self
    }

    pub fn to(mut self, address: &str) -> Self {
        self.to = Some(format!("<{}>", address));
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header("Contact", format!("<{}>", uri))
    }

    pub fn expires(self, expires: u32) -> Self {
        self.header("Expires", expires.to_string())
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// The Via is left to the transaction layer
    pub fn build(self) -> Result<SipRequest, SipError> {
        let from = self
            .from
            .ok_or_else(|| SipError::InvalidState("Request needs a From address".to_string()))?;
        let to = self.to.unwrap_or_else(|| format!("<{}>", self.uri));
        let call_id = self
            .call_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut request = SipRequest::build(self.method, &self.uri)?;
        request.push_header("Max-Forwards", "70");
        request.push_header("From", from);
        request.push_header("To", to);
        request.push_header("Call-ID", call_id);
        request.push_header("CSeq", format!("{} {}", self.cseq, self.method));
        for (name, value) in self.headers {
            request.push_header(&name, value);
        }
        request.set_body(self.body);
        Ok(request)
    }
}

/// Headers of `request` needed by hop-by-hop ACK and CANCEL
fn hop_headers(request: &SipRequest, method: SipMethod) -> Result<Vec<Header>, SipError> {
    let missing = |name: &str| SipError::ProtocolViolation(format!("Request without {}", name));
    let mut headers = Vec::new();
    let via = request.top_via().ok_or_else(|| missing("Via"))?;
    headers.push(make_header("Via", via));
    headers.push(make_header("Max-Forwards", "70"));
    let from = request.header_value("From").ok_or_else(|| missing("From"))?;
    headers.push(make_header("From", from));
    let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?;
    headers.push(make_header("Call-ID", call_id));
    let cseq = request.cseq_number().ok_or_else(|| missing("CSeq"))?;
    headers.push(make_header(
        "CSeq",
        format!("{} {}", cseq, method),
    ));
    for route in request.header_values("Route") {
        headers.push(make_header("Route", route));
    }
    Ok(headers)
}

/// ACK for a non-2xx final response to INVITE (RFC 3261 17.1.1.3)
pub fn build_non2xx_ack(
    request: &SipRequest,
    response: &SipResponse,
) -> Result<SipRequest, SipError> {
    let mut headers = hop_headers(request, SipMethod::Ack)?;
    let to = response
        .header_value("To")
        .ok_or_else(|| SipError::ProtocolViolation("Response without To".to_string()))?;
    headers.insert(3, make_header("To", to));
    headers.push(make_header("Content-Length", "0"));

    let mut ack = SipRequest::build(SipMethod::Ack, &request.uri_string())?;
    ack.inner.headers = Headers::from(headers);
    Ok(ack)
}

/// CANCEL for a pending INVITE (RFC 3261 9.1)
pub fn build_cancel(request: &SipRequest) -> Result<SipRequest, SipError> {
    if request.method() != Some(SipMethod::Invite) {
        return Err(SipError::InvalidState(
            "Only INVITE can be cancelled".to_string(),
        ));
    }
    let mut headers = hop_headers(request, SipMethod::Cancel)?;
    let to = request
        .header_value("To")
        .ok_or_else(|| SipError::ProtocolViolation("Request without To".to_string()))?;
    headers.insert(3, make_header("To", to));
    headers.push(make_header("Content-Length", "0"));

    let mut cancel = SipRequest::build(SipMethod::Cancel, &request.uri_string())?;
    cancel.inner.headers = Headers::from(headers);
    Ok(cancel)
}
