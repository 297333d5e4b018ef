//! Test doubles shared across module tests.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::compute::{ComputeProvider, Instance, InstanceSpec};
use crate::error::ProviderError;
use crate::logs::LogSink;
use crate::runtime::{CreateProjectOptions, RuntimeClient, RuntimeClientFactory};
use crate::session::{RemoteSession, SessionConnector};
use crate::tunnel::{BoxedStream, Tunnel, TunnelConfig, TunnelConnector};
use crate::types::{Project, ProjectInfo, TargetOptions, Workspace};

// ── Tunnels ─────────────────────────────────────────────────────────

/// Dials `127.0.0.1:<port>` regardless of host, recording each host.
pub struct LoopbackTunnel {
    hostname: String,
    dialed: Mutex<Vec<String>>,
}

impl LoopbackTunnel {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            dialed: Mutex::new(Vec::new()),
        }
    }

    pub fn dialed_hosts(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tunnel for LoopbackTunnel {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        self.dialed.lock().unwrap().push(host.to_string());
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Box::new(stream))
    }
}

/// In-memory tunnel whose reachability is toggled by the test.
pub struct FakeTunnel {
    reachable: AtomicBool,
    dials: Mutex<Vec<(String, u16)>>,
}

impl FakeTunnel {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            dials: Mutex::new(Vec::new()),
        }
    }

    pub fn dials(&self) -> Vec<(String, u16)> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn hostname(&self) -> &str {
        "gcp-provider-fake"
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        self.dials.lock().unwrap().push((host.to_string(), port));
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
        }
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }
}

/// Hands out one shared tunnel and counts connects.
pub struct FakeConnector {
    pub tunnel: Arc<FakeTunnel>,
    pub connects: AtomicUsize,
    pub fail: bool,
}

impl FakeConnector {
    pub fn new(tunnel: Arc<FakeTunnel>) -> Self {
        Self {
            tunnel,
            connects: AtomicUsize::new(0),
            fail: false,
        }
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn connect(&self, _config: TunnelConfig) -> Result<Arc<dyn Tunnel>, ProviderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Tunnel("auth key rejected".into()));
        }
        Ok(self.tunnel.clone())
    }
}

// ── Log capture ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Sessions ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSession {
    commands: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
}

impl RecordingSession {
    pub fn with_close_counter(closes: Arc<AtomicUsize>) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            closes,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSession for RecordingSession {
    async fn exec(&self, command: &str) -> Result<String, ProviderError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Session("control master already gone".into()))
    }
}

#[derive(Default)]
pub struct FakeSessions {
    pub opened: Mutex<Vec<(String, u16)>>,
    pub closes: Arc<AtomicUsize>,
    pub fail: bool,
}

#[async_trait]
impl SessionConnector for FakeSessions {
    async fn open(
        &self,
        _tunnel: Arc<dyn Tunnel>,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn RemoteSession>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Session("handshake failed".into()));
        }
        self.opened.lock().unwrap().push((host.to_string(), port));
        Ok(Box::new(RecordingSession::with_close_counter(self.closes.clone())))
    }
}

// ── Compute ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCompute {
    pub calls: Mutex<Vec<String>>,
    pub scripts: Mutex<Vec<String>>,
    pub instance: Instance,
    pub fail_create: bool,
}

impl FakeCompute {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn create_instance(
        &self,
        _opts: &TargetOptions,
        spec: &InstanceSpec,
        log: &mut LogSink,
    ) -> Result<(), ProviderError> {
        self.record(format!("create:{}", spec.name));
        if self.fail_create {
            return Err(ProviderError::Compute("quota exceeded".into()));
        }
        self.scripts.lock().unwrap().push(spec.startup_script.clone());
        log.line("Virtual machine created");
        Ok(())
    }

    async fn start_instance(&self, _opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        self.record(format!("start:{name}"));
        Ok(())
    }

    async fn stop_instance(&self, _opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        self.record(format!("stop:{name}"));
        Ok(())
    }

    async fn delete_instance(&self, _opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        self.record(format!("delete:{name}"));
        Ok(())
    }

    async fn get_instance(&self, _opts: &TargetOptions, name: &str) -> Result<Instance, ProviderError> {
        self.record(format!("get:{name}"));
        Ok(self.instance.clone())
    }
}

// ── Runtime ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub fail_workspace: bool,
    pub failing_project: Option<String>,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn create_workspace(
        &self,
        workspace: &Workspace,
        workspace_dir: &str,
        _log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        self.record(format!("create_workspace:{}:{workspace_dir}", workspace.id));
        session.exec(&format!("mkdir -p {workspace_dir}")).await?;
        if self.fail_workspace {
            return Err(ProviderError::Runtime("engine not ready".into()));
        }
        Ok(())
    }

    async fn create_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        _log: &mut LogSink,
        _session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        self.record(format!("create_project:{}", opts.project_dir));
        Ok(())
    }

    async fn start_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        download_url: &str,
        _log: &mut LogSink,
        _session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        self.record(format!("start_project:{}:{download_url}", opts.project.name));
        Ok(())
    }

    async fn stop_project(&self, project: &Project, _log: &mut LogSink) -> Result<(), ProviderError> {
        self.record(format!("stop_project:{}", project.name));
        Ok(())
    }

    async fn destroy_project(
        &self,
        project: &Project,
        project_dir: &str,
        _session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        self.record(format!("destroy_project:{}:{project_dir}", project.name));
        Ok(())
    }

    async fn get_project_info(&self, project: &Project) -> Result<ProjectInfo, ProviderError> {
        self.record(format!("project_info:{}", project.name));
        if self.failing_project.as_deref() == Some(project.name.as_str()) {
            return Err(ProviderError::Runtime(format!("inspect {} failed", project.name)));
        }
        Ok(ProjectInfo {
            name: project.name.clone(),
            is_running: true,
            created: "2024-05-01T10:00:00Z".into(),
            provider_metadata: String::new(),
        })
    }
}

pub struct FakeRuntimeFactory {
    pub runtime: Arc<FakeRuntime>,
    pub bound: Mutex<Vec<String>>,
}

impl FakeRuntimeFactory {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            bound: Mutex::new(Vec::new()),
        }
    }
}

impl RuntimeClientFactory for FakeRuntimeFactory {
    fn client(
        &self,
        _tunnel: Arc<dyn Tunnel>,
        workspace_id: &str,
    ) -> Result<Arc<dyn RuntimeClient>, ProviderError> {
        self.bound.lock().unwrap().push(workspace_id.to_string());
        Ok(self.runtime.clone())
    }
}
