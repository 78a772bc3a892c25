//! End-to-end pool behavior against scripted dialers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use backhaul_pool::{
    AddrResolver, Agent, AgentPool, AgentPoolConfig, AgentState, BackoffConfig, ConfigFetchError,
    DialError, NetworkingConfig, NetworkingConfigSource, PeeringMode, ProxySession,
    ResolveError, ServerHandler, SessionDialer, SessionError, SessionEvent, TunnelAddr,
    TunnelConn,
};

struct TestSession {
    principals: Vec<String>,
    events: mpsc::Receiver<SessionEvent>,
    kill: CancellationToken,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ProxySession for TestSession {
    fn principals(&self) -> &[String] {
        &self.principals
    }

    async fn next_event(&mut self) -> Result<SessionEvent, SessionError> {
        tokio::select! {
            _ = self.kill.cancelled() => Err(SessionError::Closed),
            event = self.events.recv() => event.ok_or(SessionError::Closed),
        }
    }

    async fn keepalive(&mut self) -> Result<(), SessionError> {
        if self.kill.is_cancelled() {
            Err(SessionError::Keepalive("session killed".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    kill: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    fn kill(&self) {
        self.kill.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn test_session(principals: Vec<String>) -> (TestSession, SessionHandle) {
    let (tx, rx) = mpsc::channel(8);
    let kill = CancellationToken::new();
    let closed = Arc::new(AtomicBool::new(false));
    (
        TestSession {
            principals,
            events: rx,
            kill: kill.clone(),
            closed: closed.clone(),
        },
        SessionHandle {
            events: tx,
            kill,
            closed,
        },
    )
}

type DialScript = Box<dyn Fn(usize) -> Result<Vec<String>, DialError> + Send + Sync>;

struct ScriptedDialer {
    script: DialScript,
    dials: AtomicUsize,
    dial_times: Mutex<Vec<Instant>>,
    handles: Mutex<Vec<SessionHandle>>,
}

impl ScriptedDialer {
    fn new(script: impl Fn(usize) -> Result<Vec<String>, DialError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            dials: AtomicUsize::new(0),
            dial_times: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn dial_times(&self) -> Vec<Instant> {
        self.dial_times.lock().unwrap().clone()
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.handles.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionDialer for ScriptedDialer {
    async fn dial(&self, _addr: &TunnelAddr) -> Result<Box<dyn ProxySession>, DialError> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        self.dial_times.lock().unwrap().push(Instant::now());
        let principals = (self.script)(n)?;
        let (session, handle) = test_session(principals);
        self.handles.lock().unwrap().push(handle);
        Ok(Box::new(session))
    }
}

struct FixedResolver(TunnelAddr);

#[async_trait]
impl AddrResolver for FixedResolver {
    async fn resolve(&self) -> Result<TunnelAddr, ResolveError> {
        Ok(self.0.clone())
    }
}

struct TestNetworking {
    peering: Mutex<PeeringMode>,
}

impl TestNetworking {
    fn new(peering: PeeringMode) -> Arc<Self> {
        Arc::new(Self {
            peering: Mutex::new(peering),
        })
    }

    fn set_peering(&self, peering: PeeringMode) {
        *self.peering.lock().unwrap() = peering;
    }
}

#[async_trait]
impl NetworkingConfigSource for TestNetworking {
    async fn networking_config(&self) -> Result<NetworkingConfig, ConfigFetchError> {
        Ok(NetworkingConfig {
            proxy_peering: *self.peering.lock().unwrap(),
            keepalive_interval: Duration::from_secs(5),
        })
    }
}

struct DiscardHandler;

#[async_trait]
impl ServerHandler for DiscardHandler {
    async fn handle_connection(&self, _conn: TunnelConn) {}
}

struct Recorder {
    connected: AtomicUsize,
    closed: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }
}

fn pool_config(
    dialer: Arc<ScriptedDialer>,
    networking: Arc<TestNetworking>,
    recorder: Arc<Recorder>,
) -> AgentPoolConfig {
    AgentPoolConfig::new(
        "test-cluster",
        "node-1",
        Arc::new(FixedResolver(TunnelAddr::new("proxy.test", 3024))),
        dialer,
        Arc::new(DiscardHandler),
        networking,
    )
    .with_state_callback(Arc::new(move |agent: &Agent| match agent.state() {
        AgentState::Connected => {
            recorder.connected.fetch_add(1, Ordering::SeqCst);
        }
        AgentState::Closed => {
            recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
        AgentState::Connecting => {}
    }))
}

/// Polls `cond` under the paused clock until it holds or too much virtual
/// time has passed.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(start_paused = true)]
async fn classic_mode_holds_one_agent_and_reconnects() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|_| Ok(vec!["p1.test-cluster".to_string()]));
    let pool = AgentPool::new(pool_config(
        dialer.clone(),
        TestNetworking::new(PeeringMode::Disabled),
        recorder.clone(),
    ))
    .unwrap();
    pool.start().unwrap();

    wait_until("first agent connects", || {
        recorder.connected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(pool.count(), 1);
    // Classic mode does not report bonded proxies.
    assert!(pool.connected_proxies().is_empty());

    // Only one session can claim the proxy, so the count stays at one even
    // while the supervisor keeps probing.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.count(), 1);
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);

    // Kill the live session; a replacement connects after backoff.
    dialer.handles()[0].kill();
    wait_until("replacement agent connects", || {
        recorder.connected.load(Ordering::SeqCst) == 2
    })
    .await;
    assert_eq!(pool.count(), 1);

    pool.stop().await;
    assert_eq!(pool.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn peering_mode_suppresses_extra_agents() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|_| Ok(vec!["p1.test-cluster".to_string()]));
    let pool = AgentPool::new(pool_config(
        dialer.clone(),
        TestNetworking::new(PeeringMode::Enabled),
        recorder.clone(),
    ))
    .unwrap();
    pool.start().unwrap();

    wait_until("agent connects", || pool.count() == 1).await;
    assert_eq!(pool.connected_proxies(), vec!["p1".to_string()]);

    // The supervisor holds the spare lease without dialing while policy is
    // satisfied.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(pool.count(), 1);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn peering_mode_fans_out_one_agent_per_proxy() {
    let recorder = Recorder::new();
    let proxies = ["p1", "p2", "p3"];
    let dialer = ScriptedDialer::new(move |n| {
        Ok(vec![format!("{}.test-cluster", proxies[n % proxies.len()])])
    });
    let pool = AgentPool::new(
        pool_config(dialer.clone(), TestNetworking::new(PeeringMode::Enabled), recorder.clone())
            .with_connection_count(3),
    )
    .unwrap();
    pool.start().unwrap();

    wait_until("three agents connect", || pool.count() == 3).await;

    let mut connected = pool.connected_proxies();
    connected.sort();
    assert_eq!(connected, vec!["p1", "p2", "p3"]);

    // One bonded agent per proxy; the spare lease stays parked.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pool.count(), 3);
    assert_eq!(dialer.dial_count(), 3);

    pool.stop().await;
    assert!(pool.connected_proxies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auth_failures_back_off_linearly_with_cap() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|_| Err(DialError::Auth("rejected".into())));
    let pool = AgentPool::new(
        pool_config(dialer.clone(), TestNetworking::new(PeeringMode::Disabled), recorder.clone()).with_backoff(
            BackoffConfig {
                jitter: false,
                ..BackoffConfig::default()
            },
        ),
    )
    .unwrap();
    pool.start().unwrap();

    wait_until("twelve dial attempts", || dialer.dial_count() >= 12).await;
    pool.stop().await;

    let times = dialer.dial_times();
    let deltas: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();

    // Linear ramp: 1s, 2s, ... capped at 8s.
    for (i, delta) in deltas.iter().take(11).enumerate() {
        let expected = Duration::from_secs((i as u64 + 1).min(8));
        assert!(
            *delta >= expected && *delta < expected + Duration::from_secs(1),
            "attempt {i}: expected ~{expected:?}, got {delta:?}"
        );
    }

    // No agent ever connected.
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 0);
    assert_eq!(pool.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_jitter_stays_within_bounds() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|_| Err(DialError::Auth("rejected".into())));
    let pool = AgentPool::new(pool_config(
        dialer.clone(),
        TestNetworking::new(PeeringMode::Disabled),
        recorder.clone(),
    ))
    .unwrap();
    pool.start().unwrap();

    wait_until("ten dial attempts", || dialer.dial_count() >= 10).await;
    pool.stop().await;

    let times = dialer.dial_times();
    for (i, w) in times.windows(2).take(9).enumerate() {
        let expected = Duration::from_secs((i as u64 + 1).min(8));
        let delta = w[1] - w[0];
        assert!(
            delta >= expected / 2 && delta < expected + Duration::from_secs(1),
            "attempt {i}: jittered delta {delta:?} outside [{:?}, {expected:?}]",
            expected / 2
        );
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_under_load_quiesces_everything() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|n| Ok(vec![format!("p{n}.test-cluster")]));
    let pool = AgentPool::new(
        pool_config(dialer.clone(), TestNetworking::new(PeeringMode::Enabled), recorder.clone())
            .with_connection_count(10),
    )
    .unwrap();
    pool.start().unwrap();

    wait_until("ten agents connect", || pool.count() == 10).await;

    // Give every session something in flight.
    for handle in dialer.handles() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let _ = handle
            .events
            .send(SessionEvent::ChannelOpened(Box::new(near)))
            .await;
    }

    tokio::time::timeout(Duration::from_secs(30), pool.stop())
        .await
        .expect("stop should quiesce within the keepalive interval");

    assert_eq!(pool.count(), 0);
    assert!(pool.connected_proxies().is_empty());
    for (i, handle) in dialer.handles().iter().enumerate() {
        assert!(handle.is_closed(), "session {i} leaked");
    }
    assert_eq!(
        recorder.closed.load(Ordering::SeqCst),
        recorder.connected.load(Ordering::SeqCst)
    );
}

#[tokio::test(start_paused = true)]
async fn enabling_peering_prunes_surplus_agents_oldest_first() {
    let recorder = Recorder::new();
    let dialer = ScriptedDialer::new(|n| Ok(vec![format!("p{}.test-cluster", n % 3)]));
    let networking = TestNetworking::new(PeeringMode::Disabled);
    let pool = AgentPool::new(pool_config(
        dialer.clone(),
        networking.clone(),
        recorder.clone(),
    ))
    .unwrap();
    pool.start().unwrap();

    // Classic mode fans out to all three proxies.
    wait_until("three agents connect", || pool.count() == 3).await;

    networking.set_peering(PeeringMode::Enabled);
    wait_until("surplus agents are pruned", || pool.count() == 1).await;

    // The newest agent survives, bonded to the last proxy that connected.
    wait_until("connected proxies reported", || {
        pool.connected_proxies() == vec!["p2".to_string()]
    })
    .await;

    pool.stop().await;
}
