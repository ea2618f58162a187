
#[cfg(fuzzing)]
pub mod fuzz;

use std::fmt::Debug;
use std::io::{self, Error};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use handlebars::Handlebars;
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ErrorKind,
    split,
};
use tokio::net::TcpListener;
use tokio::time::timeout;
use url::Url;

use crate::config::{self, Config};
use crate::*;

const DEFAULT_FILENAME: &str = "index.html";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 8 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

const BASE_HOST: &str = "localhost";

const LISTING_NAME: &str = "listing";
const LISTING_TEXT: &str = "<!DOCTYPE html>\n\
                            <html>\n\
                            <head><title>Index of {{path}}</title></head>\n\
                            <body>\n\
                            <h1>Index of {{path}}</h1>\n\
                            <ul>\n\
                            {{#each entries}}\
                            <li><a href=\"{{href}}\">{{name}}</a></li>\n\
                            {{/each}}\
                            </ul>\n\
                            <hr>\n\
                            <address>{{server}} at {{hostname}} port {{port}}</address>\n\
                            </body>\n\
                            </html>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug)]
pub struct Request {
    pub line: String,
    pub method: Method,
    /// normalized, still percent-encoded
    pub path: String,
    /// decoded, without empty segments
    pub segments: Vec<String>,
    pub host: Option<String>,
}

impl Request {
    fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

enum Target {
    File(PathBuf, u64),
    Listing(PathBuf),
}

/// What is left to send once the headers are out.
enum Body {
    Empty,
    Text(String),
    File(PathBuf, File),
}

#[derive(Serialize)]
struct ListingEntry {
    name: String,
    href: String,
}

#[derive(Serialize)]
struct Listing<'a> {
    path: String,
    entries: Vec<ListingEntry>,
    server: &'a str,
    hostname: &'a str,
    port: u16,
}

pub struct ServeCtx {
    port: u16,
    hostname: String,
    root: PathBuf,
    timeout: Duration,
    tmpl: Handlebars<'static>,
}

impl Debug for ServeCtx {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "ServeCtx({})", self.root.display())
    }
}

fn server_name() -> String {
    format!("{}/{}", config::NAME, config::VERSION)
}

impl ServeCtx {
    pub fn new(
        port: u16, hostname: String, root: PathBuf, timeout: Duration,
    ) -> io::Result<Self> {
        let mut tmpl = Handlebars::new();
        tmpl.register_template_string(LISTING_NAME, LISTING_TEXT)
            .map_err(|e| Error::other(format!("template error: {e}")))?;
        Ok(Self {
            port,
            hostname,
            root,
            timeout,
            tmpl,
        })
    }

    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(
            config.port,
            config.hostname.clone(),
            config.real_storage_root().to_path_buf(),
            DEFAULT_TIMEOUT,
        )
    }

    /// Read the request line and headers, up to the blank line.
    pub async fn read_request<R>(stream: &mut R) -> io::Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(1024);
        let end = loop {
            let n = stream.read_buf(&mut buf).await?;
            if let Some(pos) =
                buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
            {
                break pos;
            }
            if buf.len() >= MAX_REQUEST {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "request too long",
                ));
            }
            if n == 0 {
                if buf.is_empty() {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "no request",
                    ));
                }
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "incomplete request",
                ));
            }
        };
        if end > MAX_REQUEST {
            return Err(Error::new(ErrorKind::InvalidInput, "request too long"));
        }

        buf.truncate(end);
        match String::from_utf8(buf) {
            Ok(s) => Ok(s),
            Err(_) => Err(Error::new(ErrorKind::InvalidInput, "invalid utf8")),
        }
    }

    pub fn parse_request(raw: &str) -> io::Result<Request> {
        let mut lines = raw.split("\r\n");
        let line = lines.next().unwrap_or_default();
        let parts = line.split(' ').collect::<Vec<_>>();
        let &[method, target, version] = parts.as_slice() else {
            return Err(Error::new(ErrorKind::InvalidInput, "request line"));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(Error::new(ErrorKind::InvalidInput, "http version"));
        }
        let method = match method {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            _ => return Err(Error::new(ErrorKind::Unsupported, "method")),
        };

        let mut host = None;
        for header in lines {
            let Some((name, value)) = header.split_once(':') else {
                return Err(Error::new(ErrorKind::InvalidInput, "header"));
            };
            if name.eq_ignore_ascii_case("host") {
                let value = value.trim();
                if value.is_empty()
                    || value.chars().any(|c| {
                        c.is_ascii_control() || c.is_whitespace() || c == '/'
                    })
                {
                    return Err(Error::new(ErrorKind::InvalidInput, "host"));
                }
                host = Some(value.to_owned());
            }
        }

        let (path, segments) = Self::parse_target(target)?;
        for seg in &segments {
            if seg.starts_with('.') {
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "hidden file",
                ));
            }
            if seg.contains(['/', '\0']) {
                return Err(Error::new(ErrorKind::InvalidInput, "segment"));
            }
        }

        Ok(Request {
            line: line.to_owned(),
            method,
            path,
            segments,
            host,
        })
    }

    /// returns (normalized path, decoded segments)
    fn parse_target(target: &str) -> io::Result<(String, Vec<String>)> {
        if !target.starts_with('/') {
            return Err(Error::new(ErrorKind::InvalidInput, "target form"));
        }
        let base = Url::parse(&format!("http://{BASE_HOST}/"))
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid url"))?;
        let Ok(url) = base.join(target) else {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid url"));
        };
        if url.host_str() != Some(BASE_HOST) {
            return Err(Error::new(ErrorKind::InvalidInput, "target host"));
        }

        let segs = match url.path_segments() {
            None => Ok(Vec::new()),
            Some(path) => {
                path.map(urlencoding::decode).collect::<Result<Vec<_>, _>>()
            }
        };
        match segs {
            Err(_) => {
                Err(Error::new(ErrorKind::InvalidInput, "decode failure"))
            }
            Ok(segs) => Ok((
                url.path().to_owned(),
                segs.iter()
                    .filter(|x| !x.is_empty())
                    .map(|x| x.to_string())
                    .collect(),
            )),
        }
    }

    fn authority(&self, req: &Request) -> String {
        match req.host {
            Some(ref host) => host.clone(),
            None if self.port == config::DEFAULT_PORT => self.hostname.clone(),
            None => format!("{}:{}", self.hostname, self.port),
        }
    }

    fn redir_url(&self, req: &Request) -> String {
        format!("http://{}{}/", self.authority(req), req.path)
    }

    async fn resolve_request(&self, req: &Request) -> Result<Target, ServeError> {
        let mut fs_path = self.root.clone();
        for seg in &req.segments {
            fs_path.push(seg);
        }

        let meta = match fs::metadata(&fs_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(e.into());
            }
            Err(_) => {
                return Err(Error::new(ErrorKind::NotFound, "not found").into());
            }
        };
        if meta.is_dir() {
            if !req.is_dir() {
                return Err(ServeError::Redirect(self.redir_url(req)));
            }
            fs_path.push(DEFAULT_FILENAME);
            if let Ok(f) = fs::metadata(&fs_path).await {
                if f.is_file() {
                    return Ok(Target::File(fs_path, f.len()));
                }
            }
            fs_path.pop();
            Ok(Target::Listing(fs_path))
        } else if meta.is_file() {
            Ok(Target::File(fs_path, meta.len()))
        } else {
            Err(Error::new(ErrorKind::NotFound, "not a file").into())
        }
    }

    async fn render_listing(
        &self, req: &Request, dir: &PathBuf,
    ) -> io::Result<String> {
        let mut entries = Vec::new();
        let mut rd = fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let mut href = urlencoding::encode(&name).into_owned();
            let mut name = name;
            if entry.file_type().await?.is_dir() {
                href.push('/');
                name.push('/');
            }
            entries.push(ListingEntry { name, href });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut path = String::from("/");
        for seg in &req.segments {
            path.push_str(seg);
            path.push('/');
        }

        let server = server_name();
        let data = Listing {
            path,
            entries,
            server: &server,
            hostname: &self.hostname,
            port: self.port,
        };
        match self.tmpl.render(LISTING_NAME, &data) {
            Ok(s) => Ok(s),
            Err(e) => Err(Error::other(format!("template error: {e:?}"))),
        }
    }

    async fn write_head<W>(
        w: &mut W, status: u16, reason: &str, mime: &str, len: u64,
        location: Option<&str>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut head = format!(
            "HTTP/1.1 {status} {reason}\r\n\
             Server: {}\r\n\
             Content-Type: {mime}\r\n\
             Content-Length: {len}\r\n\
             Connection: close\r\n",
            server_name(),
        );
        if let Some(location) = location {
            head.push_str(&format!("Location: {location}\r\n"));
        }
        head.push_str("\r\n");
        w.write_all(head.as_bytes()).await
    }

    async fn send_body<W>(stream: &mut W, body: Body) -> io::Result<u64>
    where
        W: AsyncWrite + Send + Unpin,
    {
        match body {
            Body::Empty => Ok(0),
            Body::Text(text) => {
                stream.write_all(text.as_bytes()).await?;
                Ok(text.len().try_into().unwrap_or_default())
            }
            Body::File(path, f) => {
                log::debug!("sending verbatim {}", path.display());
                let mut f = BufReader::new(f);
                tokio::io::copy(&mut f, stream).await
            }
        }
    }

    /// Resolve the request and send the status line and headers.
    /// returns (body still to send, mime type)
    async fn start_response<W>(
        &self, req: &Request, stream: &mut W,
    ) -> Result<(Body, String), ServeError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let head = req.method == Method::Head;
        match self.resolve_request(req).await? {
            Target::File(path, len) => {
                log::debug!("resolved: file {path:?}");
                let mime = mime_guess::from_path(&path)
                    .first()
                    .unwrap_or(mime::APPLICATION_OCTET_STREAM);
                let mime = mime.as_ref();
                let f = File::open(&path).await?;
                Self::write_head(stream, 200, "OK", mime, len, None).await?;
                let body = if head { Body::Empty } else { Body::File(path, f) };
                Ok((body, mime.into()))
            }
            Target::Listing(dir) => {
                log::debug!("resolved: listing {dir:?}");
                let text = self.render_listing(req, &dir).await?;
                let mime = mime::TEXT_HTML_UTF_8.to_string();
                let len = text.len().try_into().unwrap_or_default();
                Self::write_head(stream, 200, "OK", &mime, len, None).await?;
                let body = if head { Body::Empty } else { Body::Text(text) };
                Ok((body, mime))
            }
        }
    }

    fn flatten_result<T, E1, E2>(
        res: Result<Result<T, E1>, E2>,
    ) -> Result<T, ServeError>
    where
        ServeError: From<E1> + From<E2>,
    {
        match res {
            Err(e) => Err(e.into()),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(x)) => Ok(x),
        }
    }

    /// returns (status code, reason) for the response, if any
    fn error_status(e: &ServeError) -> Option<(u16, &'static str)> {
        match e {
            ServeError::IoError(e) => match e.kind() {
                ErrorKind::UnexpectedEof => None,
                ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                    Some((400, "Bad Request"))
                }
                ErrorKind::PermissionDenied => Some((403, "Forbidden")),
                ErrorKind::NotFound => Some((404, "Not Found")),
                ErrorKind::Unsupported => Some((405, "Method Not Allowed")),
                ErrorKind::TimedOut => Some((408, "Request Timeout")),
                _ => Some((500, "Internal Server Error")),
            },
            ServeError::Redirect(_) => Some((301, "Moved Permanently")),
        }
    }

    async fn send_error<W>(
        w: &mut W, e: &ServeError, head: bool,
    ) -> Option<u16>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let (status, reason) = Self::error_status(e)?;
        let location = match e {
            ServeError::Redirect(url) => Some(url.as_str()),
            _ => None,
        };
        let body = format!("{status} {reason}\n");
        let mime = mime::TEXT_PLAIN_UTF_8.to_string();
        let len = body.len().try_into().unwrap_or_default();
        let _ =
            Self::write_head(w, status, reason, &mime, len, location).await;
        if !head {
            let _ = w.write_all(body.as_bytes()).await;
        }
        Some(status)
    }

    async fn handle<R, W>(&self, r: &mut R, w: &mut W, peer: &SocketAddr)
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let (mut line, mut head, mut sent) = (None, false, None);

        #[allow(clippy::never_loop)]
        let err: Option<ServeError> = loop {
            let res = timeout(self.timeout, Self::read_request(r)).await;
            let raw = break_error!(Self::flatten_result(res));

            if let Some(first) = raw.split("\r\n").next() {
                line = Some(first.to_owned());
            }
            log::debug!("request: {raw:?}");
            let req = break_error!(Self::parse_request(&raw));
            head = req.method == Method::Head;

            let res =
                timeout(self.timeout, self.start_response(&req, w)).await;
            let (body, mime) = break_error!(Self::flatten_result(res));

            // the status line is out; past here an error only drops the
            // connection
            match Self::send_body(w, body).await {
                Ok(n) => sent = Some((n, mime)),
                Err(e) => {
                    log::warn!("{peer} - {} - 200 - aborted: {e}", req.line);
                    return;
                }
            }
            break None;
        };

        let status = match err {
            Some(ref e) => {
                log::debug!("{peer} - error: {e}");
                Self::send_error(w, e, head).await
            }
            None => Some(200),
        };
        let _ = w.flush().await;

        let status = status.map(|s| s.to_string()).unwrap_or_default();
        match (line, sent) {
            (None, _) => log::info!("{peer} - [no request] - {status}"),
            (Some(line), None) => log::info!("{peer} - {line} - {status}"),
            (Some(line), Some((sent, mime))) => {
                log::info!("{peer} - {line} - {status} - {mime} - {sent} bytes")
            }
        }
    }

    async fn accepted<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut r, mut w) = split(stream);
        self.handle(&mut r, &mut w, &peer).await;
        let _ = w.shutdown().await;
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    continue;
                }
            };
            let ctx = Arc::clone(&self);
            tokio::spawn(async move {
                ctx.accepted(stream, peer).await;
            });
        }
    }
}

fn bind(port: u16) -> io::Result<std::net::TcpListener> {
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    log::info!("bound to {addr}");
    Ok(listener)
}

/// Run the daemon: bind, detach, chroot, drop privileges, then serve until
/// the process is killed.
pub fn main(config: Config) -> io::Result<()> {
    let config = config::install(config).map_err(Error::other)?;
    let _logger = logger::setup_logger(&config.log)?;
    log::info!(
        "serving {} as {} on port {}",
        config.storage_root.display(),
        config.hostname,
        config.port
    );

    let listener = bind(config.port)?;

    if config.detach {
        privilege::detach()?;
    }
    let (uid, gid) = privilege::target_ids(config.uid, config.gid);
    privilege::enter_root(config)?;
    privilege::drop_privileges(uid, gid)?;

    let ctx = Arc::new(ServeCtx::from_config(config)?);
    log::info!("ready");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let _guard = rt.enter();
    let listener = TcpListener::from_std(listener)?;
    rt.block_on(ctx.serve(listener))
}
