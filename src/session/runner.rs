use std::time::Duration;

use rand::Rng;
use tokio::select;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::session::packets;
use crate::session::retry::RetryPolicy;
use crate::session::transport::{Conduit, ConduitError, UdpConduit};
use crate::shutdown::Shutdown;

const KEEP_ALIVE1_INTERVAL: Duration = Duration::from_secs(3);
const KEEP_ALIVE2_INTERVAL: Duration = Duration::from_secs(17);

const REPLY_BUF_LEN: usize = 1024;

/// Why a cycle stopped before reaching its end.
#[derive(Debug, PartialEq, Eq)]
enum CycleEnd {
    /// the shared shutdown signal fired: leave the session silently
    Shutdown,
    /// a send/await pair exhausted its retry budget: restart from Probe
    RetriesExhausted,
}

/// Handshake state scoped to exactly one outer cycle. Created fresh every time
/// the cycle (re)starts; nothing carries over between cycles.
struct CycleState {
    kp1_cnt: u8,
    seed: [u8; 4],
    server_ip: [u8; 4],
    kp2_cnt: u8,
    kp2_flag: [u8; 2],
    kp2_key: [u8; 4],
    nonce: [u8; 2],
}

impl CycleState {
    fn new() -> CycleState {
        CycleState {
            kp1_cnt: 1,
            seed: [0; 4],
            server_ip: [0; 4],
            kp2_cnt: 0,
            kp2_flag: [0; 2],
            kp2_key: [0; 4],
            nonce: rand::thread_rng().gen::<u16>().to_be_bytes(),
        }
    }
}

/// Drives one session's keep-alive handshake until the shutdown signal fires.
pub struct SessionRunner {
    config: SessionConfig,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl SessionRunner {
    pub fn new(config: SessionConfig, policy: RetryPolicy, shutdown: Shutdown) -> SessionRunner {
        SessionRunner { config, policy, shutdown }
    }

    /// Fails only on configuration or socket setup problems; once the
    /// handshake loop is running, the only way out is the shutdown signal.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(tag = %self.config.tag, "start");
        let result = self.run_inner().await;
        if let Err(e) = &result {
            error!(tag = %self.config.tag, "session failed: {:#}", e);
        }
        info!(tag = %self.config.tag, "exit");
        result
    }

    async fn run_inner(&self) -> anyhow::Result<()> {
        let conduit = UdpConduit::connect(
            self.config.remote_addr(),
            self.config.bind_device(),
            self.shutdown.clone(),
        )
        .await?;
        if let Some(device) = self.config.bind_device() {
            info!(tag = %self.config.tag, "bound to device {}", device);
        }

        self.keep_alive_loop(&conduit).await;
        Ok(())
    }

    async fn keep_alive_loop(&self, conduit: &dyn Conduit) {
        loop {
            match self.run_cycle(conduit).await {
                Ok(()) => {}
                Err(CycleEnd::RetriesExhausted) => {
                    error!(tag = %self.config.tag, "keep alive failed, restarting from probe");
                }
                Err(CycleEnd::Shutdown) => return,
            }
        }
    }

    async fn run_cycle(&self, conduit: &dyn Conduit) -> Result<(), CycleEnd> {
        let mut state = CycleState::new();
        let mut reply = [0u8; REPLY_BUF_LEN];

        // Probe: the reply carries the seed and the server's view of our
        // address at fixed offsets
        let pk = packets::keep_alive1_packet1(state.kp1_cnt);
        self.exchange(conduit, &pk, &mut reply, "keep alive 1 packet 1").await?;
        state.seed.copy_from_slice(&reply[8..12]);
        state.server_ip.copy_from_slice(&reply[12..16]);

        // Ack1: echo seed and address back; the reply is not parsed further
        state.kp1_cnt = state.kp1_cnt.wrapping_add(1) % 0xff;
        let pk = packets::keep_alive1_packet2(
            &state.seed,
            &state.server_ip,
            self.config.keep_alive1_flag(),
            state.kp1_cnt,
            self.config.enable_crypt,
        );
        self.exchange(conduit, &pk, &mut reply, "keep alive 1 packet 2").await?;

        self.pause(KEEP_ALIVE1_INTERVAL).await?;

        // Negotiate2a: the server may demand extra rounds (opcode 0x07 with
        // 0x10 in the third byte), updating the flag each time, before it
        // hands out the key
        loop {
            let pk = packets::keep_alive2_packet1(
                state.kp2_cnt,
                &state.kp2_flag,
                &state.nonce,
                &state.kp2_key,
            );
            self.exchange(conduit, &pk, &mut reply, "keep alive 2 packet 1").await?;
            if reply[0] == 0x07 && reply[2] == 0x10 {
                state.kp2_flag.copy_from_slice(&reply[6..8]);
                state.kp2_cnt = state.kp2_cnt.wrapping_add(1);
                continue;
            }
            break;
        }
        state.kp2_key.copy_from_slice(&reply[16..20]);
        state.kp2_cnt = state.kp2_cnt.wrapping_add(1);

        // Negotiate2b: closes the sub-negotiation; the reply is not parsed
        let pk = packets::keep_alive2_packet2(
            state.kp2_cnt,
            &state.kp2_flag,
            &state.nonce,
            &state.kp2_key,
            &state.server_ip,
        );
        self.exchange(conduit, &pk, &mut reply, "keep alive 2 packet 2").await?;

        self.pause(KEEP_ALIVE2_INTERVAL).await
    }

    /// One send/await pair under the retry policy. A closed conduit ends the
    /// session; any other error or timeout consumes one attempt.
    async fn exchange(
        &self,
        conduit: &dyn Conduit,
        packet: &[u8],
        reply: &mut [u8],
        what: &str,
    ) -> Result<usize, CycleEnd> {
        let mut attempts = 0;
        loop {
            match self.try_exchange(conduit, packet, reply, what).await {
                Ok(n) => return Ok(n),
                Err(ConduitError::Closed) => return Err(CycleEnd::Shutdown),
                Err(e) => {
                    attempts += 1;
                    debug!(tag = %self.config.tag, "{} attempt {} failed: {}", what, attempts, e);
                    if attempts >= self.policy.max_attempts {
                        return Err(CycleEnd::RetriesExhausted);
                    }
                }
            }
        }
    }

    async fn try_exchange(
        &self,
        conduit: &dyn Conduit,
        packet: &[u8],
        reply: &mut [u8],
        what: &str,
    ) -> Result<usize, ConduitError> {
        conduit.send(packet, self.policy.write_timeout).await?;
        debug!(tag = %self.config.tag, "send {} => {:02x?}", what, packet);

        // zeroed before every read: fixed-offset fields of short replies read
        // as zeroes, never as bytes of an earlier datagram
        reply.fill(0);
        let n = conduit.recv(reply, self.policy.read_timeout).await?;
        debug!(tag = %self.config.tag, "recv {} <= {:02x?}", what, &reply[..n]);
        Ok(n)
    }

    async fn pause(&self, interval: Duration) -> Result<(), CycleEnd> {
        let mut shutdown = self.shutdown.clone();
        select! {
            _ = sleep(interval) => Ok(()),
            _ = shutdown.triggered() => Err(CycleEnd::Shutdown),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::shutdown::shutdown_channel;

    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            tag: "test".to_string(),
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_port: 0,
            keep_alive1_flag: 0,
            enable_crypt: false,
            bind_device: None,
            bind_to_addr: false,
        }
    }

    /// Answers each exchange from a fixed script; an exhausted script reports
    /// the conduit as closed, which cleanly ends the session.
    struct ScriptedConduit {
        replies: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedConduit {
        fn new(replies: Vec<Vec<u8>>) -> ScriptedConduit {
            ScriptedConduit {
                replies: Mutex::new(replies.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Conduit for ScriptedConduit {
        async fn send(&self, packet: &[u8], _deadline: Duration) -> Result<usize, ConduitError> {
            self.sent.lock().unwrap().push(packet.to_vec());
            Ok(packet.len())
        }

        async fn recv(&self, buf: &mut [u8], _deadline: Duration) -> Result<usize, ConduitError> {
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(reply.len())
                }
                None => Err(ConduitError::Closed),
            }
        }
    }

    /// Every send attempt fails with a timeout.
    #[derive(Default)]
    struct FailingConduit {
        sends: AtomicU32,
    }

    #[async_trait]
    impl Conduit for FailingConduit {
        async fn send(&self, _packet: &[u8], deadline: Duration) -> Result<usize, ConduitError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Err(ConduitError::TimedOut(deadline))
        }

        async fn recv(&self, _buf: &mut [u8], deadline: Duration) -> Result<usize, ConduitError> {
            Err(ConduitError::TimedOut(deadline))
        }
    }

    fn probe_reply(seed: [u8; 4], server_ip: [u8; 4]) -> Vec<u8> {
        let mut reply = vec![0u8; 32];
        reply[0] = 0x07;
        reply[8..12].copy_from_slice(&seed);
        reply[12..16].copy_from_slice(&server_ip);
        reply
    }

    fn negotiate_demand(flag: [u8; 2]) -> Vec<u8> {
        let mut reply = vec![0u8; 32];
        reply[0] = 0x07;
        reply[2] = 0x10;
        reply[6..8].copy_from_slice(&flag);
        reply
    }

    fn negotiate_final(key: [u8; 4]) -> Vec<u8> {
        let mut reply = vec![0u8; 32];
        reply[0] = 0x07;
        reply[2] = 0x28;
        reply[16..20].copy_from_slice(&key);
        reply
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_with_negotiate_rounds() {
        let conduit = ScriptedConduit::new(vec![
            probe_reply([0x11, 0x22, 0x33, 0x44], [10, 0, 0, 1]),
            vec![0x07, 0x02, 0x10, 0x00], // ack reply, not parsed
            negotiate_demand([0xaa, 0xbb]),
            negotiate_demand([0xcc, 0xdd]),
            negotiate_final([9, 8, 7, 6]),
            vec![0x07, 0x04, 0x28, 0x00], // final reply, not parsed
        ]);
        let (_trigger, shutdown) = shutdown_channel();
        let runner = SessionRunner::new(test_config(), RetryPolicy::default(), shutdown);

        let started = Instant::now();
        runner.run_cycle(&conduit).await.unwrap();
        // the two inter-phase pauses dominate the (virtual) elapsed time
        assert!(started.elapsed() >= Duration::from_secs(20));

        let sent = conduit.sent();
        assert_eq!(sent.len(), 6);

        // probe with counter 1, ack with counter 2 echoing seed and address
        assert_eq!(sent[0], &[0x07, 0x01, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(sent[1][1], 2);
        assert_eq!(&sent[1][12..16], &[10, 0, 0, 1]);
        assert_eq!(&sent[1][20..24], &[0x11, 0x22, 0x33, 0x44]);

        // two demanded extra rounds: counter advances, flag follows the server
        assert_eq!(sent[2][1], 0);
        assert_eq!(&sent[2][6..8], &[0, 0]);
        assert_eq!(&sent[2][16..20], &[0, 0, 0, 0]);
        assert_eq!(sent[3][1], 1);
        assert_eq!(&sent[3][6..8], &[0xaa, 0xbb]);
        assert_eq!(sent[4][1], 2);
        assert_eq!(&sent[4][6..8], &[0xcc, 0xdd]);

        // closing packet carries the negotiated key and the server ip
        assert_eq!(sent[5][1], 3);
        assert_eq!(sent[5][5], 0x03);
        assert_eq!(&sent[5][16..20], &[9, 8, 7, 6]);
        assert_eq!(&sent[5][28..32], &[10, 0, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_counts_attempts() {
        let conduit = FailingConduit::default();
        let (_trigger, shutdown) = shutdown_channel();
        let runner = SessionRunner::new(test_config(), RetryPolicy::default(), shutdown);

        let result = runner.run_cycle(&conduit).await;
        assert_eq!(result, Err(CycleEnd::RetriesExhausted));
        assert_eq!(conduit.sends.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_conduit_ends_session_silently() {
        // empty script: the very first read reports the conduit closed
        let conduit = ScriptedConduit::new(vec![]);
        let (_trigger, shutdown) = shutdown_channel();
        let runner = SessionRunner::new(test_config(), RetryPolicy::default(), shutdown);

        // returns instead of restarting forever
        runner.keep_alive_loop(&conduit).await;
        assert_eq!(conduit.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_pause() {
        let (trigger, shutdown) = shutdown_channel();
        let runner = SessionRunner::new(test_config(), RetryPolicy::default(), shutdown);

        trigger.trigger();
        let result = runner.pause(Duration::from_secs(3600)).await;
        assert_eq!(result, Err(CycleEnd::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_cycle_gets_fresh_state() {
        let cycle = |seed: [u8; 4]| {
            vec![
                probe_reply(seed, [10, 0, 0, 1]),
                vec![0x07, 0x02, 0x10, 0x00],
                negotiate_final([1, 1, 1, 1]),
                vec![0x07, 0x02, 0x28, 0x00],
            ]
        };
        let mut replies = cycle([1, 2, 3, 4]);
        replies.extend(cycle([5, 6, 7, 8]));
        let conduit = ScriptedConduit::new(replies);

        let (_trigger, shutdown) = shutdown_channel();
        let runner = SessionRunner::new(test_config(), RetryPolicy::default(), shutdown);

        // two complete cycles, then the exhausted script closes the conduit
        runner.keep_alive_loop(&conduit).await;

        let sent = conduit.sent();
        assert_eq!(sent.len(), 9);

        // each cycle restarts its counters and echoes its own seed
        assert_eq!(sent[4][1], 1); // second probe, counter back to 1
        assert_eq!(&sent[5][20..24], &[5, 6, 7, 8]);
        assert_eq!(sent[8][1], 1); // third probe before the close

        // fresh nonce per cycle (2-byte values, distinct with high probability)
        let first_nonce = &sent[2][8..10];
        let second_nonce = &sent[6][8..10];
        assert_ne!(first_nonce, second_nonce);
    }
}
