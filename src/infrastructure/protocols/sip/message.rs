//! SIP message types and correlation header access
//!
//! The engine only reads and writes the headers it needs for correlation:
//! Via (branch, transport), From/To (tag), CSeq, Call-ID, Contact, Expires,
//! Record-Route and Route. Everything else is carried through untouched.

use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{BranchId, ChannelKey, SipMethod, TransportProtocol};
use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use std::fmt;

impl SipMethod {
    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::PRack => Some(SipMethod::Prack),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

/// Expand RFC3261 compact header names
fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "v" => "via".to_string(),
        "f" => "from".to_string(),
        "t" => "to".to_string(),
        "i" => "call-id".to_string(),
        "m" => "contact".to_string(),
        "l" => "content-length".to_string(),
        "c" => "content-type".to_string(),
        "k" => "supported".to_string(),
        _ => lower,
    }
}

/// Split a header into its name and raw value
fn split_header(header: &Header) -> (String, String) {
    if let Header::Other(name, value) = header {
        return (name.clone(), value.trim().to_string());
    }
    let text = header.to_string();
    match text.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (text, String::new()),
    }
}

fn header_is(header: &Header, name: &str) -> bool {
    canonical_name(&split_header(header).0) == canonical_name(name)
}

/// Build a header from its name, using the typed rsip variant when one exists
pub fn make_header(name: &str, value: impl Into<String>) -> Header {
    let value = value.into();
    match canonical_name(name).as_str() {
        "via" => Header::Via(value.into()),
        "from" => Header::From(value.into()),
        "to" => Header::To(value.into()),
        "call-id" => Header::CallId(value.into()),
        "cseq" => Header::CSeq(value.into()),
        "contact" => Header::Contact(value.into()),
        "expires" => Header::Expires(value.into()),
        "max-forwards" => Header::MaxForwards(value.into()),
        "route" => Header::Route(value.into()),
        "record-route" => Header::RecordRoute(value.into()),
        "authorization" => Header::Authorization(value.into()),
        "proxy-authorization" => Header::ProxyAuthorization(value.into()),
        "content-length" => Header::ContentLength(value.into()),
        "user-agent" => Header::UserAgent(value.into()),
        _ => Header::Other(name.to_string(), value),
    }
}

/// Split a comma separated header value, ignoring commas inside quotes and
/// angle brackets
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    for ch in value.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => {
                if !current.trim().is_empty() {
                    items.push(current.trim().to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Header parameters of a name-addr or Via value (everything after the
/// address part)
fn header_params(value: &str) -> &str {
    let tail = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    match tail.find(';') {
        Some(pos) => &tail[pos + 1..],
        None => "",
    }
}

/// Read one `;name=value` parameter of a header value
pub fn header_param(value: &str, name: &str) -> Option<String> {
    header_params(value).split(';').find_map(|param| {
        let (key, val) = match param.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => (param.trim(), ""),
        };
        key.eq_ignore_ascii_case(name)
            .then(|| val.trim_matches('"').to_string())
    })
}

/// Replace or add a `;name=value` parameter on a header value
pub fn with_header_param(value: &str, name: &str, param: &str) -> String {
    let (address, params) = match value.rfind('>') {
        Some(pos) => {
            let (addr, rest) = value.split_at(pos + 1);
            (addr.to_string(), rest.to_string())
        }
        None => match value.find(';') {
            Some(pos) => {
                let (addr, rest) = value.split_at(pos);
                (addr.to_string(), rest.to_string())
            }
            None => (value.to_string(), String::new()),
        },
    };
    let mut kept: Vec<String> = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let key = p.split('=').next().unwrap_or_default().trim();
            !key.eq_ignore_ascii_case(name)
        })
        .map(str::to_string)
        .collect();
    kept.push(format!("{}={}", name, param));
    format!("{};{}", address.trim_end(), kept.join(";"))
}

/// The URI part of a name-addr (`"Bob" <sip:bob@host>;tag=1` gives
/// `sip:bob@host`)
pub fn addr_uri(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].trim().to_string();
        }
    }
    value.split(';').next().unwrap_or_default().trim().to_string()
}

/// Parse the next hop of a SIP URI into a channel key
pub fn hop_from_uri(uri: &str) -> Result<ChannelKey, SipError> {
    // a bare URI keeps its parameters, a name-addr is unwrapped
    let uri = if uri.contains('<') {
        addr_uri(uri)
    } else {
        uri.trim().to_string()
    };
    let (secure, rest) = if let Some(rest) = uri.strip_prefix("sips:") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("sip:") {
        (false, rest)
    } else {
        return Err(SipError::ProtocolViolation(format!(
            "Unsupported URI scheme: {}",
            uri
        )));
    };

    let rest = rest.split('?').next().unwrap_or_default();
    let mut parts = rest.split(';');
    let user_host = parts.next().unwrap_or_default();
    let host_port = match user_host.rfind('@') {
        Some(pos) => &user_host[pos + 1..],
        None => user_host,
    };

    let mut transport = if secure {
        TransportProtocol::Tls
    } else {
        TransportProtocol::Udp
    };
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("transport") {
                transport = TransportProtocol::from_name(value.trim()).ok_or_else(|| {
                    SipError::ProtocolViolation(format!("Unknown transport: {}", value))
                })?;
            }
        }
    }

    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        // IPv6 reference
        let end = stripped
            .find(']')
            .ok_or_else(|| SipError::ProtocolViolation(format!("Bad IPv6 host: {}", uri)))?;
        let host = &stripped[..end];
        let port = stripped[end + 1..].strip_prefix(':').map(str::parse::<u16>);
        (host.to_string(), port)
    } else {
        match host_port.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port.parse::<u16>())),
            None => (host_port.to_string(), None),
        }
    };

    if host.is_empty() {
        return Err(SipError::ProtocolViolation(format!("URI without host: {}", uri)));
    }
    let port = match port {
        Some(Ok(port)) => port,
        Some(Err(_)) => {
            return Err(SipError::ProtocolViolation(format!("Bad port in URI: {}", uri)))
        }
        None => transport.default_port(),
    };

    Ok(ChannelKey::new(transport, host, port))
}

/// Read and edit access to the correlation headers of a message
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn headers_mut(&mut self) -> &mut Headers;

    /// All raw values of a header, in message order
    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers()
            .iter()
            .filter(|h| header_is(h, name))
            .map(|h| split_header(h).1)
            .collect()
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.headers()
            .iter()
            .find(|h| header_is(h, name))
            .map(|h| split_header(h).1)
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers().iter().any(|h| header_is(h, name))
    }

    fn remove_header(&mut self, name: &str) {
        self.headers_mut().retain(|h| !header_is(h, name));
    }

    fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers_mut().push(make_header(name, value));
    }

    /// Replace every occurrence of a header with a single value
    fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let header = make_header(name, value);
        let mut replaced = false;
        self.headers_mut().retain(|h| {
            if header_is(h, name) {
                if replaced {
                    return false;
                }
                replaced = true;
            }
            true
        });
        if replaced {
            for h in self.headers_mut().iter_mut() {
                if header_is(h, name) {
                    *h = header;
                    return;
                }
            }
        } else {
            self.headers_mut().push(header);
        }
    }

    fn call_id(&self) -> Option<String> {
        self.header_value("Call-ID")
    }

    fn from_tag(&self) -> Option<String> {
        self.header_value("From").and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.header_value("To")
            .and_then(|v| header_param(&v, "tag"))
            .filter(|tag| !tag.is_empty())
    }

    /// CSeq number and method
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header_value("CSeq")?;
        let mut parts = value.split_whitespace();
        let number = parts.next()?.parse::<u32>().ok()?;
        let method = SipMethod::from_name(parts.next()?)?;
        Some((number, method))
    }

    fn cseq_number(&self) -> Option<u32> {
        self.cseq().map(|(number, _)| number)
    }

    fn top_via(&self) -> Option<String> {
        self.header_values("Via")
            .into_iter()
            .flat_map(|v| split_list(&v))
            .next()
    }

    fn branch(&self) -> Option<BranchId> {
        self.top_via()
            .and_then(|via| header_param(&via, "branch"))
            .filter(|b| !b.is_empty())
            .map(BranchId::new)
    }

    /// Transport named in the top Via (`SIP/2.0/UDP host`)
    fn via_transport(&self) -> Option<TransportProtocol> {
        let via = self.top_via()?;
        let proto = via.split_whitespace().next()?;
        TransportProtocol::from_name(proto.rsplit('/').next()?)
    }

    fn expires(&self) -> Option<u32> {
        self.header_value("Expires")
            .and_then(|v| v.trim().parse::<u32>().ok())
    }

    fn contacts(&self) -> Vec<String> {
        self.header_values("Contact")
            .iter()
            .flat_map(|v| split_list(v))
            .collect()
    }

    fn contact_uri(&self) -> Option<String> {
        self.contacts().first().map(|c| addr_uri(c))
    }

    /// Record-Route entries in message order
    fn record_routes(&self) -> Vec<String> {
        self.header_values("Record-Route")
            .iter()
            .flat_map(|v| split_list(v))
            .collect()
    }

    fn routes(&self) -> Vec<String> {
        self.header_values("Route")
            .iter()
            .flat_map(|v| split_list(v))
            .collect()
    }

    /// True when a provisional response is sent reliably (RFC3262)
    fn requires_100rel(&self) -> bool {
        self.header_values("Require")
            .iter()
            .flat_map(|v| split_list(v))
            .any(|opt| opt.eq_ignore_ascii_case("100rel"))
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    /// Build a request with an empty header set
    pub fn build(method: SipMethod, uri: &str) -> Result<Self, SipError> {
        let uri = Uri::try_from(uri)?;
        Ok(Self::new(Request {
            method: method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::default(),
            body: Vec::new(),
        }))
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn uri_string(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn set_uri(&mut self, uri: &str) -> Result<(), SipError> {
        self.inner.uri = Uri::try_from(uri)?;
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.set_header("Content-Length", body.len().to_string());
        self.inner.body = body;
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }

    /// Next hop: first Route entry if any, otherwise the Request-URI
    pub fn next_hop(&self) -> Result<ChannelKey, SipError> {
        match self.routes().first() {
            Some(route) => hop_from_uri(route),
            None => hop_from_uri(&self.uri_string()),
        }
    }

    /// Rewrite the CSeq number, keeping the method
    pub fn set_cseq(&mut self, number: u32) -> Result<(), SipError> {
        let method = self
            .method()
            .ok_or_else(|| SipError::ProtocolViolation("Unknown request method".to_string()))?;
        self.set_header("CSeq", format!("{} {}", number, method));
        Ok(())
    }

    /// Set the branch of the top Via, adding a Via when there is none
    pub fn set_branch(&mut self, branch: &BranchId, sent_by: &str, transport: TransportProtocol) {
        let top = self.top_via();
        let via = match top {
            Some(via) => with_header_param(&via, "branch", branch.as_str()),
            None => format!(
                "SIP/2.0/{} {};branch={};rport",
                transport.as_str(),
                sent_by,
                branch
            ),
        };
        let mut others: Vec<String> = self
            .header_values("Via")
            .iter()
            .flat_map(|v| split_list(v))
            .collect();
        if !others.is_empty() {
            others.remove(0);
        }
        self.remove_header("Via");
        // Via must stay ahead of the other headers
        let mut headers: Vec<Header> = Vec::new();
        headers.push(make_header("Via", via));
        for other in others {
            headers.push(make_header("Via", other));
        }
        headers.extend(self.inner.headers.iter().cloned());
        self.inner.headers = Headers::from(headers);
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn build(status_code: u16) -> Self {
        Self::new(Response {
            status_code: StatusCode::from(status_code),
            version: Version::V2,
            headers: Headers::default(),
            body: Vec::new(),
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn reason(&self) -> String {
        let text = self.inner.status_code.to_string();
        let code = self.status_code().to_string();
        text.trim_start_matches(code.as_str()).trim().to_string()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn is_final(&self) -> bool {
        self.status_code() >= 200
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl SipHeaders for SipMessage {
    fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(resp) => resp.headers(),
        }
    }

    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => req.headers_mut(),
            SipMessage::Response(resp) => resp.headers_mut(),
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>;expires=1200\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(
            req.call_id(),
            Some("a84b4c76e66710@pc33.example.com".to_string())
        );
        assert_eq!(req.cseq(), Some((314159, SipMethod::Register)));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.branch(), Some(BranchId::new("z9hG4bK776asdhds")));
        assert_eq!(req.via_transport(), Some(TransportProtocol::Udp));
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(
            req.contact_uri(),
            Some("sip:alice@192.168.1.100:5060".to_string())
        );
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert!(resp.is_success());
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert_eq!(resp.record_routes().len(), 2);
    }

    #[test]
    fn test_header_params() {
        let value = "\"Bob\" <sip:bob@biloxi.com;transport=tcp>;tag=a6c85cf;expires=60";
        assert_eq!(header_param(value, "tag"), Some("a6c85cf".to_string()));
        assert_eq!(header_param(value, "expires"), Some("60".to_string()));
        // transport belongs to the URI, not to the header
        assert_eq!(header_param(value, "transport"), None);
        assert_eq!(addr_uri(value), "sip:bob@biloxi.com;transport=tcp");

        let updated = with_header_param(value, "tag", "xyz");
        assert_eq!(header_param(&updated, "tag"), Some("xyz".to_string()));
        assert_eq!(header_param(&updated, "expires"), Some("60".to_string()));
    }

    #[test]
    fn test_split_list_respects_brackets() {
        let items = split_list("<sip:a@x;lr>, \"B, b\" <sip:b@y>");
        assert_eq!(items.len(), 2);
        assert_eq!(addr_uri(&items[1]), "sip:b@y");
    }

    #[test]
    fn test_hop_from_uri() {
        let hop = hop_from_uri("sip:alice@atlanta.com:5070;transport=tcp").unwrap();
        assert_eq!(hop.transport, TransportProtocol::Tcp);
        assert_eq!(hop.host, "atlanta.com");
        assert_eq!(hop.port, 5070);

        let hop = hop_from_uri("<sips:[2001:db8::1]>").unwrap();
        assert_eq!(hop.transport, TransportProtocol::Tls);
        assert_eq!(hop.host, "2001:db8::1");
        assert_eq!(hop.port, 5061);

        assert!(hop_from_uri("tel:+15551234").is_err());
    }

    #[test]
    fn test_set_branch_replaces_top_via() {
        let mut req = SipRequest::parse(REGISTER).unwrap();
        let branch = BranchId::new("z9hG4bKnew");
        req.set_branch(&branch, "10.0.0.1:5060", TransportProtocol::Udp);
        assert_eq!(req.branch(), Some(branch));
        assert_eq!(req.header_values("Via").len(), 1);
    }

    #[test]
    fn test_set_branch_adds_missing_via() {
        let mut req = SipRequest::build(SipMethod::Options, "sip:bob@10.0.0.2").unwrap();
        let branch = BranchId::new("z9hG4bKadded");
        req.set_branch(&branch, "10.0.0.1:5060", TransportProtocol::Udp);
        assert_eq!(req.branch(), Some(branch));
        assert_eq!(
            req.top_via().unwrap(),
            "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKadded;rport"
        );
    }

    #[test]
    fn test_set_header_and_cseq() {
        let mut req = SipRequest::parse(REGISTER).unwrap();
        req.set_cseq(314160).unwrap();
        assert_eq!(req.cseq(), Some((314160, SipMethod::Register)));
        req.set_header("Expires", "0");
        assert_eq!(req.expires(), Some(0));
        assert_eq!(req.header_values("Expires").len(), 1);
        req.remove_header("Contact");
        assert!(req.contact_uri().is_none());
    }
}
