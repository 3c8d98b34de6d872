//! 服务器管理器
//!
//! [`ServerManage`] 把传输层策略和两个相互独立的线程池组合在一起：
//!
//! - 接受运行时：专用的 tokio 多线程运行时，运行接受循环和每个连接的 IO 任务
//! - 处理线程池：固定数量的 OS 线程，执行应用的请求回调
//!
//! 生命周期：`Created --begin()--> Running --close()--> Stopping --> Closed`。
//! 关闭后的实例不能再次启动。

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{RatError, RatResult};
use crate::server::config::ManageConfig;
use crate::server::registry::ConnectionRegistry;
use crate::server::session::Session;
use crate::server::session::connection::run_connection;
use crate::server::transport::tls_config::{CaFile, TlsMaterial};
use crate::server::transport::{BoxedStream, TcpTransport, TlsTransport, Transport};
use crate::server::worker_pool::{SubmitError, WorkerPool};
use crate::server::{PeerAddr, SessionId, lock_unpoisoned};
use crate::utils::logger::{Logger, debug, error, info, warn};

#[cfg(unix)]
use crate::server::transport::LocalTransport;

/// 请求完成回调，在处理线程池中执行
pub type HttpAcceptedCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync + 'static>;

type ReadyToCloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// 管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageState {
    Created,
    Running,
    Stopping,
    Closed,
}

/// 接受循环与连接任务共享的部分
struct Shared<T: Transport> {
    transport: T,
    config: Arc<ManageConfig>,
    registry: ConnectionRegistry,
    callback: RwLock<Option<HttpAcceptedCallback>>,
    in_flight: InFlight,
    next_id: AtomicU64,
}

/// 生命周期状态与关闭通知，关闭可能在独立线程中完成
struct Lifecycle {
    state: Mutex<ManageState>,
    state_changed: Condvar,
    ready_to_close: Mutex<Option<ReadyToCloseCallback>>,
}

impl Lifecycle {
    fn mark_closed(&self) {
        *lock_unpoisoned(&self.state) = ManageState::Closed;
        self.state_changed.notify_all();

        let notify = lock_unpoisoned(&self.ready_to_close).take();
        if let Some(notify) = notify {
            notify();
        }
    }
}

/// 运行期间才存在的资源
struct RunningParts {
    runtime: Runtime,
    pool: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

pub struct ServerManage<T: Transport> {
    shared: Arc<Shared<T>>,
    lifecycle: Arc<Lifecycle>,
    running: Mutex<Option<RunningParts>>,
}

/// TCP 服务器
pub type TcpServerManage = ServerManage<TcpTransport>;
/// HTTPS 服务器
pub type SslServerManage = ServerManage<TlsTransport>;
/// 本地套接字服务器
#[cfg(unix)]
pub type LocalServerManage = ServerManage<LocalTransport>;

impl<T: Transport + Default> ServerManage<T> {
    /// 使用默认配置创建，仅指定处理线程数
    pub fn new(handle_max_thread_count: usize) -> Self {
        Self::with_config(ManageConfig::with_handle_threads(handle_max_thread_count))
    }

    pub fn with_config(config: ManageConfig) -> Self {
        Self::with_transport(T::default(), config)
    }
}

impl<T: Transport> ServerManage<T> {
    pub fn with_transport(transport: T, config: ManageConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config: Arc::new(config),
                registry: ConnectionRegistry::new(),
                callback: RwLock::new(None),
                in_flight: InFlight::default(),
                next_id: AtomicU64::new(1),
            }),
            lifecycle: Arc::new(Lifecycle {
                state: Mutex::new(ManageState::Created),
                state_changed: Condvar::new(),
                ready_to_close: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManageConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn state(&self) -> ManageState {
        *lock_unpoisoned(&self.lifecycle.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManageState::Running && self.shared.transport.is_running()
    }

    /// 实际监听地址，绑定端口 0 时用它取得系统分配的端口
    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.shared.transport.local_addr()
    }

    /// 当前登记的会话数
    pub fn active_session_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// 设置请求完成回调，可在运行期间替换
    pub fn set_http_accepted_callback<F>(&self, callback: F)
    where
        F: Fn(Arc<Session>) + Send + Sync + 'static,
    {
        let callback: HttpAcceptedCallback = Arc::new(callback);
        match self.shared.callback.write() {
            Ok(mut slot) => *slot = Some(callback),
            Err(poisoned) => *poisoned.into_inner() = Some(callback),
        }
    }

    /// 设置关闭完成通知，只会触发一次
    pub fn set_ready_to_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock_unpoisoned(&self.lifecycle.ready_to_close) = Some(Box::new(callback));
    }

    /// 启动服务
    ///
    /// 先在接受运行时上执行传输层的 `on_start`，成功后才启动接受循环和处理线程池；
    /// 失败时管理器保持 `Created` 状态。
    pub fn begin(&self) -> RatResult<()> {
        let mut state = lock_unpoisoned(&self.lifecycle.state);
        match *state {
            ManageState::Running | ManageState::Stopping => return Err(RatError::AlreadyRunning),
            ManageState::Closed => return Err(RatError::Closed),
            ManageState::Created => {}
        }

        let config = self.shared.config.clone();
        config.validate()?;
        if let Some(log_config) = config.log.clone().filter(|_| !Logger::is_initialized()) {
            Logger::init(log_config).map_err(RatError::ConfigError)?;
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.accept_thread_count)
            .thread_name("rat-accept")
            .enable_all()
            .build()?;

        // 通过通道取回结果，调用方是否处于 tokio 上下文都可以安全等待
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let shared = self.shared.clone();
        runtime.spawn(async move {
            let _ = started_tx.send(shared.transport.on_start().await);
        });
        let started = started_rx
            .recv()
            .unwrap_or_else(|_| Err(RatError::TransportError("启动任务异常结束".to_string())));
        if let Err(e) = started {
            error!("❌ [{}] 启动失败: {}", self.shared.transport.name(), e);
            runtime.shutdown_background();
            return Err(e);
        }

        let pool = match WorkerPool::new("rat-handle", config.handle_max_thread_count, config.handle_queue_capacity) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                self.shared.transport.on_finish();
                runtime.shutdown_background();
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = runtime.spawn(accept_loop(self.shared.clone(), pool.clone(), shutdown_rx));

        *lock_unpoisoned(&self.running) = Some(RunningParts {
            runtime,
            pool,
            shutdown_tx,
            accept_task,
        });
        *state = ManageState::Running;

        info!(
            "🚀 [{}] 服务已启动: 处理线程 {}，接受线程 {}",
            self.shared.transport.name(),
            config.handle_max_thread_count,
            config.accept_thread_count
        );
        Ok(())
    }

    /// 关闭服务，可重复调用
    ///
    /// 依次：停止接受新连接、在宽限期内等待处理任务和写出中的回复、驱逐所有会话、
    /// 关闭接受运行时、释放监听端点，最后触发关闭完成通知。
    ///
    /// 在请求回调内部调用时立即返回，关闭由独立线程在该回调结束后完成，
    /// 回调之后的回复仍会正常写出；可用 [`wait_closed`](Self::wait_closed) 等待。
    pub fn close(&self) {
        let parts = {
            let mut state = lock_unpoisoned(&self.lifecycle.state);
            match *state {
                ManageState::Stopping | ManageState::Closed => return,
                ManageState::Created => {
                    *state = ManageState::Closed;
                    None
                }
                ManageState::Running => {
                    *state = ManageState::Stopping;
                    lock_unpoisoned(&self.running).take()
                }
            }
        };

        let Some(parts) = parts else {
            self.lifecycle.mark_closed();
            return;
        };

        if parts.pool.is_current_worker() {
            self.close_in_background(parts);
            return;
        }

        stop_running(&self.shared, parts);
        self.lifecycle.mark_closed();
    }

    /// 阻塞等待进入 `Closed` 状态，超时返回 `false`
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let state = lock_unpoisoned(&self.lifecycle.state);
        let result = self
            .lifecycle
            .state_changed
            .wait_timeout_while(state, timeout, |state| *state != ManageState::Closed);
        match result {
            Ok((state, _)) => *state == ManageState::Closed,
            Err(poisoned) => *poisoned.into_inner().0 == ManageState::Closed,
        }
    }

    fn close_in_background(&self, parts: RunningParts) {
        debug!("🧵 [线程池 {}] 在处理线程内请求关闭，转交独立线程完成", parts.pool.name());

        let job = Arc::new(Mutex::new(Some(parts)));
        let job_in_thread = job.clone();
        let shared = self.shared.clone();
        let lifecycle = self.lifecycle.clone();
        let spawned = std::thread::Builder::new().name("rat-close".to_string()).spawn(move || {
            let parts = lock_unpoisoned(&job_in_thread).take();
            if let Some(parts) = parts {
                stop_running(&shared, parts);
            }
            lifecycle.mark_closed();
        });

        if let Err(e) = spawned {
            error!("❌ 启动关闭线程失败，改为在当前线程关闭: {}", e);
            let parts = lock_unpoisoned(&job).take();
            if let Some(parts) = parts {
                stop_running(&self.shared, parts);
            }
            self.lifecycle.mark_closed();
        }
    }
}

fn stop_running<T: Transport>(shared: &Shared<T>, parts: RunningParts) {
    let name = shared.transport.name();
    let grace = shared.config.shutdown_grace_duration();
    let deadline = Instant::now() + grace;
    info!("🛑 [{}] 正在关闭服务，执行中的处理任务 {} 个", name, parts.pool.active_count());

    let _ = parts.shutdown_tx.send(true);
    parts.accept_task.abort();

    let abandoned = parts.pool.shutdown(grace);
    if abandoned > 0 {
        warn!("{}", RatError::ShutdownTimeout(format!("{} 个处理任务超过宽限期 {:?}", abandoned, grace)));
    }

    // 已回复的会话写完再驱逐
    let unfinished = shared.in_flight.wait_drained(deadline);
    if unfinished > 0 {
        debug!("⏰ [{}] {} 个会话在宽限期内未完成回复", name, unfinished);
    }

    let evicted = shared.registry.evict_all();
    if evicted > 0 {
        debug!("🧹 [{}] 驱逐 {} 个会话", name, evicted);
    }

    // 在 tokio 上下文中不能阻塞等待运行时关闭
    if Handle::try_current().is_ok() {
        parts.runtime.shutdown_background();
    } else {
        let remaining = deadline.saturating_duration_since(Instant::now());
        parts.runtime.shutdown_timeout(remaining.max(Duration::from_millis(100)));
    }

    shared.transport.on_finish();
    info!("✅ [{}] 服务已关闭", name);
}

impl ServerManage<TcpTransport> {
    /// 监听 `address:port`，端口为 0 时由系统分配
    pub fn listen(&self, address: IpAddr, port: u16) -> RatResult<()> {
        self.shared.transport.set_endpoint(address, port)?;
        self.begin()
    }
}

impl ServerManage<TlsTransport> {
    /// 以 HTTPS 监听
    ///
    /// `ca_files` 中每一项为 `(路径, 是否为 PEM)`，这些证书附加在服务端证书链之后。
    pub fn listen(
        &self,
        address: IpAddr,
        port: u16,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_files: &[(PathBuf, bool)],
    ) -> RatResult<()> {
        let material = TlsMaterial {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_files: ca_files.iter().cloned().map(CaFile::from).collect(),
        };
        self.shared.transport.set_tls_material(material)?;
        self.shared.transport.set_endpoint(address, port)?;
        self.begin()
    }
}

#[cfg(unix)]
impl ServerManage<LocalTransport> {
    /// 监听本地套接字
    pub fn listen(&self, name: &str) -> RatResult<()> {
        self.shared.transport.set_name(name)?;
        self.begin()
    }
}

impl<T: Transport> Drop for ServerManage<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop<T: Transport>(shared: Arc<Shared<T>>, pool: Arc<WorkerPool>, mut shutdown_rx: watch::Receiver<bool>) {
    let name = shared.transport.name();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = shared.transport.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("🔗 [{}] 新连接: {}", name, peer);
                    let shared = shared.clone();
                    let pool = pool.clone();
                    tokio::spawn(shared.new_session(stream, peer, pool));
                }
                Err(e) => {
                    warn!("⚠️ [{}] 接受连接失败: {}", name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("🛑 [{}] 接受循环已退出", name);
}

impl<T: Transport> Shared<T> {
    /// 完成握手后登记会话并启动它的 IO 任务
    async fn new_session(self: Arc<Self>, stream: BoxedStream, peer: PeerAddr, pool: Arc<WorkerPool>) {
        let handshake = self.transport.handshake(stream, &peer);
        let stream = match tokio::time::timeout(self.config.handshake_timeout_duration(), handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("🚫 [{}] 握手失败，丢弃连接: {}", self.transport.name(), e);
                return;
            }
            Err(_) => {
                debug!("⏰ [{}] 与 {} 握手超时，丢弃连接", self.transport.name(), peer);
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        self.registry
            .register(id, move || tokio::spawn(shared.serve(id, stream, peer, pool)).abort_handle());
    }

    async fn serve(self: Arc<Self>, id: SessionId, stream: BoxedStream, peer: PeerAddr, pool: Arc<WorkerPool>) {
        let in_flight = InFlightGuard::new(&self.in_flight);
        let outcome = run_connection(stream, id, peer, self.config.clone(), |session| {
            in_flight.arm();
            self.handle_accepted(session, &pool);
        })
        .await;
        drop(in_flight);

        self.registry.remove(id);
        debug!("🔚 [会话 {}] 结束: {:?}", id, outcome);
    }

    /// 把完成的会话交给处理线程池
    ///
    /// 回调结束后（包括 panic）会话从登记表移除；队列已满时直接回复 503。
    fn handle_accepted(self: &Arc<Self>, session: Arc<Session>, pool: &WorkerPool) {
        let callback = match self.callback.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(callback) = callback else {
            warn!("⚠️ [会话 {}] 未设置请求回调，关闭连接", session.id());
            return;
        };

        let id = session.id();
        let fallback = session.clone();
        let shared = self.clone();
        let submitted = pool.try_execute(move || {
            let _evict = EvictOnDrop {
                registry: &shared.registry,
                id,
            };
            callback(session);
        });

        match submitted {
            Ok(()) => {}
            Err(SubmitError::Full) => {
                warn!("🚦 [会话 {}] 处理队列已满，回复 503", id);
                fallback.reply_text_with_status("Service Unavailable", 503);
            }
            Err(SubmitError::Closed) => {
                debug!("🛑 [会话 {}] 处理线程池已关闭，丢弃会话", id);
            }
        }
    }
}

struct EvictOnDrop<'a> {
    registry: &'a ConnectionRegistry,
    id: SessionId,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

/// 请求已完成、回复尚未写完的会话计数
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *lock_unpoisoned(&self.count) += 1;
    }

    fn leave(&self) {
        let mut count = lock_unpoisoned(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// 等待计数归零，返回截止时仍未完成的数量
    fn wait_drained(&self, deadline: Instant) -> usize {
        let count = lock_unpoisoned(&self.count);
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.drained.wait_timeout_while(count, timeout, |count| *count > 0) {
            Ok((count, _)) => *count,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// 请求完成时计入 [`InFlight`]，IO 任务结束（或被中止）时扣除
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    armed: AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn new(in_flight: &'a InFlight) -> Self {
        Self {
            in_flight,
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            self.in_flight.enter();
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            self.in_flight.leave();
        }
    }
}
