// ── Connection establishment: TCP / ProxyCommand socket, then handshake ──────

use crate::ssh::link::Readiness;
use crate::ssh::options::SessionOptions;
use crate::ssh::paths;
use crate::ssh::status::transport_error;
use log::{debug, info, warn};
use rssh_core::{LogVerbosity, SshError, SshErrorKind, SshResult};
use socket2::{Domain, Protocol, Socket, Type};
use ssh2::{MethodType, TraceFlags};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, RawSocket};

#[cfg(unix)]
pub type RawSocketHandle = RawFd;
#[cfg(windows)]
pub type RawSocketHandle = RawSocket;

/// A freshly handshaken transport plus what keeps it alive.
pub(crate) struct Transport {
    pub ssh: ssh2::Session,
    pub readiness: Arc<Readiness>,
    pub raw_socket: RawSocketHandle,
    pub banner: Option<String>,
    pub proxy: Option<ProxyProcess>,
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// Connect and handshake according to `options`. Blocks.
pub(crate) fn establish(options: &SessionOptions, session_id: &str) -> SshResult<Transport> {
    let host = options
        .host
        .clone()
        .ok_or_else(|| SshError::connection("hostname required before connect"))?;
    if !options.ssh2 {
        return Err(SshError::connection(
            "SSH-2 is disabled and the transport only speaks SSH-2",
        ));
    }
    let port = options.port_or_default();
    let timeout = options.timeout().filter(|t| !t.is_zero());

    let (stream, proxy) = match &options.proxy_command {
        Some(command) => {
            let command = paths::expand_format(command, &options.expand_context())?;
            open_proxy(&command)?
        }
        None => {
            let tcp = tcp_connect(&host, port, options.bind_address.as_deref(), timeout)?;
            (Stream::Tcp(tcp), None)
        }
    };

    let mut ssh = ssh2::Session::new()
        .map_err(|e| transport_error(SshErrorKind::Connection, "cannot create session", &e))?;
    if let Some(t) = timeout {
        ssh.set_timeout(t.as_millis().min(u32::MAX as u128) as u32);
    }
    apply_negotiation(&ssh, options)?;
    ssh.trace(trace_flags(options.log_verbosity));

    let (readiness, raw_socket) = attach(&mut ssh, stream)?;

    ssh.handshake().map_err(|e| {
        transport_error(
            SshErrorKind::Connection,
            &format!("handshake with {}:{} failed", host, port),
            &e,
        )
    })?;
    ssh.set_timeout(0);

    let banner = ssh.banner().map(|b| b.to_string());
    info!(
        "[{}] connected to {}:{} ({})",
        session_id,
        host,
        port,
        banner.as_deref().unwrap_or("no banner")
    );

    Ok(Transport {
        ssh,
        readiness: Arc::new(readiness),
        raw_socket,
        banner,
        proxy,
    })
}

fn apply_negotiation(ssh: &ssh2::Session, options: &SessionOptions) -> SshResult<()> {
    let pref = |method: MethodType, list: &str| {
        ssh.method_pref(method, list)
            .map_err(|e| transport_error(SshErrorKind::ProtocolOption, "algorithm preference rejected", &e))
    };

    ssh.set_compress(options.compression_enabled());
    if let Some(methods) = options.compression_methods() {
        pref(MethodType::CompCs, methods)?;
        pref(MethodType::CompSc, methods)?;
    }
    if let Some(level) = options.compression_level {
        debug!("compression level {} requested; the transport uses its default", level);
    }
    if let Some(kex) = &options.key_exchange {
        pref(MethodType::Kex, kex)?;
    }
    if let Some(host_keys) = &options.host_keys {
        pref(MethodType::HostKey, host_keys)?;
    }
    if options.gssapi_client_identity.is_some()
        || options.gssapi_server_identity.is_some()
        || options.gssapi_delegate_credentials.is_some()
    {
        debug!("GSSAPI options are recorded but the transport does not offer gssapi-with-mic");
    }
    Ok(())
}

pub(crate) fn trace_flags(verbosity: LogVerbosity) -> TraceFlags {
    match verbosity {
        LogVerbosity::None => TraceFlags::empty(),
        LogVerbosity::Warn => TraceFlags::ERROR,
        LogVerbosity::Info => TraceFlags::ERROR | TraceFlags::AUTH | TraceFlags::CONN,
        LogVerbosity::Debug => {
            TraceFlags::ERROR
                | TraceFlags::AUTH
                | TraceFlags::CONN
                | TraceFlags::KEX
                | TraceFlags::PUBLICKEY
                | TraceFlags::SCP
        }
        LogVerbosity::Trace => TraceFlags::all(),
    }
}

#[cfg(unix)]
fn attach(ssh: &mut ssh2::Session, stream: Stream) -> SshResult<(Readiness, RawSocketHandle)> {
    match stream {
        Stream::Tcp(tcp) => {
            let raw = tcp.as_raw_fd();
            let watch: OwnedFd = tcp.try_clone()?.into();
            ssh.set_tcp_stream(tcp);
            Ok((Readiness::new(watch), raw))
        }
        Stream::Unix(sock) => {
            let raw = sock.as_raw_fd();
            let watch: OwnedFd = sock.try_clone()?.into();
            ssh.set_tcp_stream(sock);
            Ok((Readiness::new(watch), raw))
        }
    }
}

#[cfg(windows)]
fn attach(ssh: &mut ssh2::Session, stream: Stream) -> SshResult<(Readiness, RawSocketHandle)> {
    match stream {
        Stream::Tcp(tcp) => {
            let raw = tcp.as_raw_socket();
            ssh.set_tcp_stream(tcp);
            Ok((Readiness::new(), raw))
        }
    }
}

// ── TCP ──────────────────────────────────────────────────────────────────────

fn resolve_bind(bind: &str) -> SshResult<Vec<IpAddr>> {
    if let Ok(ip) = bind.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addrs = (bind, 0)
        .to_socket_addrs()
        .map_err(|e| SshError::connection(format!("cannot resolve bind address {}: {}", bind, e)))?;
    Ok(addrs.map(|a| a.ip()).collect())
}

fn tcp_connect(
    host: &str,
    port: u16,
    bind: Option<&str>,
    timeout: Option<Duration>,
) -> SshResult<TcpStream> {
    let targets: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SshError::connection(format!("cannot resolve {}: {}", host, e)))?
        .collect();
    let bind_ips = match bind {
        Some(b) => Some(resolve_bind(b)?),
        None => None,
    };

    let mut last_err: Option<SshError> = None;
    for addr in targets {
        let local = match &bind_ips {
            Some(ips) => match ips.iter().find(|ip| ip.is_ipv4() == addr.is_ipv4()) {
                Some(ip) => Some(SocketAddr::new(*ip, 0)),
                None => continue,
            },
            None => None,
        };
        match connect_one(addr, local, timeout) {
            Ok(stream) => {
                debug!("tcp connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                warn!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        SshError::connection(format!("no usable address for {}:{}", host, port))
    }))
}

fn connect_one(
    addr: SocketAddr,
    local: Option<SocketAddr>,
    timeout: Option<Duration>,
) -> SshResult<TcpStream> {
    let to_conn_err = |e: std::io::Error| {
        let err = SshError::connection(format!("{}: {}", addr, e));
        match e.raw_os_error() {
            Some(code) => err.with_code(code),
            None => err,
        }
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(to_conn_err)?;
    if let Some(local) = local {
        socket.bind(&local.into()).map_err(to_conn_err)?;
    }
    let connected = match timeout {
        Some(t) => socket.connect_timeout(&addr.into(), t),
        None => socket.connect(&addr.into()),
    };
    connected.map_err(to_conn_err)?;
    let stream: TcpStream = socket.into();
    stream.set_nodelay(true).ok();
    Ok(stream)
}

// ── ProxyCommand ─────────────────────────────────────────────────────────────

/// A running ProxyCommand; killed when dropped.
pub(crate) struct ProxyProcess {
    child: std::process::Child,
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
fn open_proxy(command: &str) -> SshResult<(Stream, Option<ProxyProcess>)> {
    use std::io::Write;
    use std::process::{Command, Stdio};
    use std::thread;

    let (ours, theirs) = UnixStream::pair()?;
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| SshError::connection(format!("cannot start ProxyCommand '{}': {}", command, e)))?;

    let (Some(mut child_in), Some(mut child_out)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        return Err(SshError::connection("ProxyCommand pipes unavailable"));
    };
    let mut from_ssh = theirs.try_clone()?;
    let mut to_ssh = theirs;

    thread::Builder::new()
        .name("rssh-proxy-up".into())
        .spawn(move || {
            let _ = std::io::copy(&mut from_ssh, &mut child_in);
            let _ = child_in.flush();
        })?;
    thread::Builder::new()
        .name("rssh-proxy-down".into())
        .spawn(move || {
            let _ = std::io::copy(&mut child_out, &mut to_ssh);
            let _ = to_ssh.shutdown(std::net::Shutdown::Write);
        })?;

    debug!("ProxyCommand started: {}", command);
    Ok((Stream::Unix(ours), Some(ProxyProcess { child })))
}

#[cfg(not(unix))]
fn open_proxy(command: &str) -> SshResult<(Stream, Option<ProxyProcess>)> {
    Err(SshError::connection(format!(
        "ProxyCommand '{}' is only supported on unix",
        command
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::options::SessionOption;
    use std::net::TcpListener;

    #[test]
    fn missing_host_is_connection_error() {
        let err = establish(&SessionOptions::default(), "t").err().unwrap();
        assert_eq!(err.kind, SshErrorKind::Connection);
    }

    #[test]
    fn ssh2_disabled_is_connection_error() {
        let mut opts = SessionOptions::default();
        opts.apply(SessionOption::Host("127.0.0.1".into())).unwrap();
        opts.apply(SessionOption::Protocol(vec![1])).unwrap();
        let err = establish(&opts, "t").err().unwrap();
        assert_eq!(err.kind, SshErrorKind::Connection);
    }

    #[test]
    fn refused_port_is_connection_error() {
        // grab a free port, then close it so nothing listens there
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = tcp_connect("127.0.0.1", port, None, Some(Duration::from_secs(2))).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Connection);
    }

    #[test]
    fn connects_with_bind_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = tcp_connect("127.0.0.1", port, Some("127.0.0.1"), None).unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[test]
    fn handshake_against_non_ssh_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            use std::io::Write;
            if let Ok((mut conn, _)) = listener.accept() {
                let _ = conn.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            }
        });

        let mut opts = SessionOptions::default();
        opts.apply(SessionOption::Host("127.0.0.1".into())).unwrap();
        opts.apply(SessionOption::Port(port)).unwrap();
        opts.apply(SessionOption::Timeout(5)).unwrap();
        let err = establish(&opts, "t").err().unwrap();
        assert_eq!(err.kind, SshErrorKind::Connection);
        server.join().unwrap();
    }

    #[test]
    fn trace_flags_grow_with_verbosity() {
        assert!(trace_flags(LogVerbosity::None).is_empty());
        assert!(trace_flags(LogVerbosity::Debug).contains(TraceFlags::KEX));
        assert_eq!(trace_flags(LogVerbosity::Trace), TraceFlags::all());
    }
}
