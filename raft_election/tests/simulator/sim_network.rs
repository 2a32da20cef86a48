use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::time::Duration;

use mock_instant::MockClock;
use raft_election::rpc::RpcMessage;
use raft_election::ServerId;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, LogNormal};
use tracing::{debug, trace};

use super::common::{SimTime, WakeUpAtOrBefore};
use super::sim_log::{LoggedSimEvent, SimLog, SimLogEntry};
use super::sim_transport::SimTransportConnector;

use rand_distr::num_traits::ToPrimitive;

#[derive(Debug, Clone)]
pub(crate) struct PacketLossProbability(pub(crate) f64);
#[derive(Debug, Clone)]
pub(crate) struct LatencyMean(pub(crate) f64);
#[derive(Debug, Clone)]
pub(crate) struct LatencyStdDev(pub(crate) f64);

struct NetworkConnectionQuality {
    /// Probability that a message is dropped.
    packet_loss: Bernoulli,
    /// Latency is drawn from a log-normal distribution.
    latency: LogNormal<f64>,
}

struct NetworkNode {
    incoming_message_tx: mpsc::Sender<RpcMessage>,
}

/// Models a network with packet loss and latency between every pair of
/// servers. Partitions are expressed as certain loss on the links that cross
/// partition boundaries.
pub(crate) struct SimNetwork {
    pub(crate) server_ids: HashSet<ServerId>,
    servers: HashMap<ServerId, NetworkNode>,
    connections: HashMap<(ServerId, ServerId), NetworkConnectionQuality>,
    default_packet_loss: PacketLossProbability,
    outbound_message_tx: mpsc::Sender<RpcMessage>,
    outbound_message_rx: mpsc::Receiver<RpcMessage>,
    wake_up_tx: mpsc::Sender<WakeUpAtOrBefore>,
    maybe_wake_up_rx: Option<mpsc::Receiver<WakeUpAtOrBefore>>,
}

impl SimNetwork {
    /// Creates a fully connected network with the same packet loss and
    /// latency profile on every link. A single-server network has no links.
    pub(crate) fn with_defaults(
        num_servers: u64,
        packet_loss: PacketLossProbability,
        mean_latency: LatencyMean,
        latency_std_dev: LatencyStdDev,
    ) -> Self {
        assert!(
            (0.0..=1.0).contains(&packet_loss.0),
            "drop probability should be between 0 and 1"
        );
        assert!(
            mean_latency.0 >= 0.0 && latency_std_dev.0 >= 0.0,
            "latency profile should be non-negative"
        );

        let server_ids: HashSet<ServerId> = (0..num_servers).map(ServerId).collect();
        let mut connections = HashMap::new();
        for from in &server_ids {
            for to in &server_ids {
                if from != to {
                    let _ = connections.insert(
                        (*from, *to),
                        NetworkConnectionQuality {
                            packet_loss: Bernoulli::new(packet_loss.0)
                                .expect("could not create Bernoulli distribution for packet loss"),
                            latency: LogNormal::new(mean_latency.0.ln(), latency_std_dev.0)
                                .expect("could not create LogNormal distribution for latency"),
                        },
                    );
                }
            }
        }

        let (outbound_message_tx, outbound_message_rx) = mpsc::channel();
        let (wake_up_tx, wake_up_rx) = mpsc::channel();

        SimNetwork {
            server_ids,
            servers: HashMap::new(),
            connections,
            default_packet_loss: packet_loss,
            outbound_message_tx,
            outbound_message_rx,
            wake_up_tx,
            maybe_wake_up_rx: Some(wake_up_rx),
        }
    }

    /// Registers a server with the network and hands back the transport
    /// connector its node thread should use. Re-joining replaces the
    /// server's previous connection (used when a node restarts).
    pub(crate) fn join_network_and_take_connector(
        &mut self,
        server_id: ServerId,
    ) -> SimTransportConnector {
        assert!(
            self.server_ids.contains(&server_id),
            "server {server_id:?} is not part of this network"
        );
        let (inbound_message_tx, inbound_message_rx) = mpsc::channel();
        let _ = self.servers.insert(
            server_id,
            NetworkNode {
                incoming_message_tx: inbound_message_tx,
            },
        );
        SimTransportConnector::new(
            self.outbound_message_tx.clone(),
            inbound_message_rx,
            self.wake_up_tx.clone(),
        )
    }

    pub(crate) fn take_wake_up_rx(&mut self) -> mpsc::Receiver<WakeUpAtOrBefore> {
        self.maybe_wake_up_rx
            .take()
            .expect("wake-up receiver already taken")
    }

    /// Splits the network into disjoint partitions; links that cross a
    /// partition boundary drop every message.
    pub(crate) fn partition_network(&mut self, partitions: Vec<HashSet<ServerId>>) {
        let mut all_servers = HashSet::new();
        for partition in &partitions {
            for server in partition {
                assert!(
                    all_servers.insert(*server),
                    "server {server:?} is in multiple partitions"
                );
            }
        }
        for server in &self.server_ids {
            assert!(
                all_servers.contains(server),
                "server {server:?} is not in any partition"
            );
        }

        let links: Vec<(ServerId, ServerId)> = self.connections.keys().cloned().collect();
        for (from, to) in links {
            let from_partition = partitions
                .iter()
                .find(|partition| partition.contains(&from))
                .expect("every server is in a partition");
            if !from_partition.contains(&to) {
                self.connections
                    .get_mut(&(from, to))
                    .expect("link exists")
                    .packet_loss = Bernoulli::new(1.0).expect("certain loss is a valid Bernoulli");
            }
        }
    }

    /// Restores every link to the network's configured loss rate.
    pub(crate) fn heal_network_partition(&mut self) {
        for connection in self.connections.values_mut() {
            connection.packet_loss = Bernoulli::new(self.default_packet_loss.0)
                .expect("configured loss is a valid Bernoulli");
        }
    }

    /// Drops every server's inbound connection so parked node threads
    /// observe a transport shutdown once woken.
    pub(crate) fn disconnect_all(&mut self) {
        self.servers.clear();
    }

    fn determine_when_and_if_message_should_be_delivered(
        &self,
        message: RpcMessage,
        rng: &mut ChaCha8Rng,
    ) -> Option<(RpcMessage, SimTime)> {
        let to = message.to();
        let from = message.from();
        let time = MockClock::time();

        let connection = self
            .connections
            .get(&(from, to))
            .unwrap_or_else(|| panic!("no link between {from:?} and {to:?}"));
        let drop_message = connection.packet_loss.sample(rng);
        let message_latency = connection
            .latency
            .sample(rng)
            .to_u64()
            .expect("could not convert latency to u64");
        let delivery_time = time + Duration::from_millis(message_latency);
        if drop_message {
            trace!(
                "DROPPING NETWORK MESSAGE: from {from:?} to {to:?} at {time:?}ms - {message:?}",
                from = from,
                to = to,
                time = time.as_millis(),
                message = message
            );
            None
        } else {
            trace!(
                "QUEUEING NETWORK MESSAGE: from {from:?} to {to:?} for {delivery_time:?}ms with latency {message_latency:?}ms - {message:?}",
                from = from,
                to = to,
                delivery_time = delivery_time.as_millis(),
                message_latency = message_latency,
                message = message
            );
            Some((message, SimTime(delivery_time)))
        }
    }

    /// Collects everything the server processes have sent since the last
    /// call, deciding for each message whether and when it arrives.
    pub(crate) fn get_all_queued_outbound_messages(
        &mut self,
        rng: &mut ChaCha8Rng,
        log: &mut SimLog,
    ) -> Vec<(RpcMessage, SimTime)> {
        let mut messages = Vec::new();

        while let Ok(message) = self.outbound_message_rx.try_recv() {
            let message_cloned = message.clone();
            if let Some(message_to_be_delivered) =
                self.determine_when_and_if_message_should_be_delivered(message, rng)
            {
                messages.push(message_to_be_delivered);
            } else {
                log.push(SimLogEntry::EventProcessed(
                    SimTime::now(),
                    LoggedSimEvent::DroppedNetworkMessage(message_cloned),
                ));
            }
        }

        messages
    }

    /// Hands a message to the target server's inbound queue.
    pub(crate) fn deliver_message(&mut self, target: ServerId, message: RpcMessage) {
        let network_node = self
            .servers
            .get_mut(&target)
            .unwrap_or_else(|| panic!("no server with id {target:?} in the simulation"));

        if network_node.incoming_message_tx.send(message).is_err() {
            debug!("could not deliver network message (node thread shut down?)");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use raft_election::rpc::{Request, RequestVote, RpcMessage};
    use raft_election::{RaftTransportConnector, ServerId, TermIndex};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use test_log::test;
    use uuid::Uuid;

    use crate::simulator::common::clock_guard;
    use crate::simulator::sim_log::SimLog;

    use super::{LatencyMean, LatencyStdDev, PacketLossProbability, SimNetwork};

    fn outgoing_vote_request(from: u64, to: u64) -> Request {
        Request::RequestVote(RequestVote {
            request_id: Uuid::new_v4(),
            candidate_id: ServerId(from),
            to: ServerId(to),
            term: TermIndex(1),
        })
    }

    #[test]
    fn queued_outbound_messages_are_routed_with_a_delivery_time() {
        let _clock = clock_guard();
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut network = SimNetwork::with_defaults(
            2,
            PacketLossProbability(0.0),
            LatencyMean(1.0),
            LatencyStdDev(0.1),
        );

        let mut transport = network.join_network_and_take_connector(ServerId(0));

        let outgoing_message = outgoing_vote_request(0, 1);
        let expected_message = outgoing_message.clone();
        transport
            .enqueue_outgoing_request(outgoing_message)
            .expect("transport should accept the request");

        let mut sim_log = SimLog::new(None);
        let messages = network.get_all_queued_outbound_messages(&mut rng, &mut sim_log);
        assert_eq!(messages.len(), 1);

        match &messages[0].0 {
            RpcMessage::Request(request) => assert_eq!(request, &expected_message),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[test]
    fn a_lossy_link_drops_messages() {
        let _clock = clock_guard();
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut network = SimNetwork::with_defaults(
            2,
            PacketLossProbability(1.0),
            LatencyMean(1.0),
            LatencyStdDev(0.1),
        );

        let mut transport = network.join_network_and_take_connector(ServerId(0));
        transport
            .enqueue_outgoing_request(outgoing_vote_request(0, 1))
            .expect("transport should accept the request");

        let mut sim_log = SimLog::new(None);
        let messages = network.get_all_queued_outbound_messages(&mut rng, &mut sim_log);
        assert_eq!(messages.len(), 0);
    }

    #[test]
    fn delivery_reaches_the_target_server_transport() {
        let _clock = clock_guard();
        let mut network = SimNetwork::with_defaults(
            2,
            PacketLossProbability(0.0),
            LatencyMean(1.0),
            LatencyStdDev(0.1),
        );

        let mut dest_transport = network.join_network_and_take_connector(ServerId(0));

        let incoming_message = outgoing_vote_request(1, 0);
        let expected_message = incoming_message.clone();

        network.deliver_message(ServerId(0), RpcMessage::Request(incoming_message));

        let received = dest_transport
            .wait_for_next_incoming_message(Duration::from_secs(1))
            .expect("transport should stay up");
        match received {
            Some(RpcMessage::Request(request)) => assert_eq!(expected_message, request),
            other => panic!("expected a request, got {other:?}"),
        }
    }
}
