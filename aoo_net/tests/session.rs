//! Full session flows over the in-process transport double: login,
//! group management, peer handshake, eject and notifications.

use aoo_net::client::{Client, MessageTarget, SessionState};
use aoo_net::peer::PeerMessage;
use aoo_net::server::Server;
use aoo_net::{
    AooError, Binding, ClientEvent, Connector, ErrorReply, LocalReactor, Response, ServerLink,
};
use aoo_wire::time::NtpTime;
use aoo_wire::{HostName, Id, Metadata};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SERVER_ADDR: &str = "203.0.113.9:7078";

fn server_host() -> HostName {
    HostName::new("203.0.113.9", 7078)
}

/// Connects a client's TCP side straight into the shared server object.
struct LocalConnector {
    server: Arc<Mutex<Server>>,
}

impl Connector for LocalConnector {
    fn connect(&mut self, _host: &HostName) -> Result<ServerLink, ErrorReply> {
        let (c2s_tx, c2s_rx) = unbounded::<Vec<u8>>();
        let (s2c_tx, s2c_rx) = unbounded::<(Vec<u8>, SocketAddr)>();
        let id = self.server.lock().add_client(Binding::Local(s2c_tx));
        let server = self.server.clone();
        thread::spawn(move || {
            while let Ok(bytes) = c2s_rx.recv() {
                if server.lock().handle_client_data(id, &bytes).is_err() {
                    break;
                }
            }
            let _ = server.lock().remove_client(id);
        });
        Ok(ServerLink::local(c2s_tx, s2c_rx))
    }
}

struct TestNode {
    client: Arc<Client>,
    events: Receiver<ClientEvent>,
    addr: SocketAddr,
}

struct TestNet {
    server: Arc<Mutex<Server>>,
    server_addr: SocketAddr,
    endpoints: Arc<Mutex<HashMap<SocketAddr, Sender<(Vec<u8>, SocketAddr)>>>>,
}

impl TestNet {
    fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(Server::new())),
            server_addr: SERVER_ADDR.parse().unwrap(),
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawns a client node with its own network thread and UDP router.
    fn spawn_node(&self, addr: &str) -> TestNode {
        let addr: SocketAddr = addr.parse().unwrap();
        let (reactor, out_rx) = LocalReactor::new(addr);
        self.endpoints.lock().insert(addr, reactor.injector());

        let reactor = Arc::new(reactor);
        let client = Arc::new(Client::with_connector(
            reactor,
            Box::new(LocalConnector {
                server: self.server.clone(),
            }),
        ));
        let events = client.events();

        // UDP router: deliver this node's outgoing datagrams
        let server = self.server.clone();
        let server_addr = self.server_addr;
        let endpoints = self.endpoints.clone();
        thread::spawn(move || {
            while let Ok((data, dst)) = out_rx.recv() {
                if dst == server_addr {
                    let mut replies: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
                    let _ = server.lock().handle_udp_message(&data, addr, &mut |d, a| {
                        replies.push((d.to_vec(), a));
                    });
                    for (reply, target) in replies {
                        if target == addr {
                            if let Some(tx) = endpoints.lock().get(&addr) {
                                let _ = tx.send((reply, server_addr));
                            }
                        } else if let Some(tx) = endpoints.lock().get(&target) {
                            // relayed traffic keeps the server as the
                            // apparent sender
                            let _ = tx.send((reply, server_addr));
                        }
                    }
                } else if let Some(tx) = endpoints.lock().get(&dst) {
                    let _ = tx.send((data, addr));
                }
            }
        });

        let runner = client.clone();
        thread::spawn(move || runner.run());

        TestNode {
            client,
            events,
            addr,
        }
    }
}

fn connect(node: &TestNode) -> Result<Id, ErrorReply> {
    let (tx, rx) = unbounded();
    node.client.connect(
        server_host(),
        "letmein",
        None,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(Duration::from_secs(5)).expect("connect reply") {
        Ok(Response::Connect { client_id, .. }) => Ok(client_id),
        Ok(other) => panic!("unexpected response {other:?}"),
        Err(e) => Err(e),
    }
}

fn join(node: &TestNode, group: &str, user: &str) -> Result<(Id, Id), ErrorReply> {
    join_with_pwd(node, group, "", user, "")
}

fn join_with_pwd(
    node: &TestNode,
    group: &str,
    group_pwd: &str,
    user: &str,
    user_pwd: &str,
) -> Result<(Id, Id), ErrorReply> {
    let (tx, rx) = unbounded();
    node.client.join_group(
        group,
        group_pwd,
        user,
        user_pwd,
        None,
        None,
        HostName::default(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(Duration::from_secs(5)).expect("join reply") {
        Ok(Response::GroupJoin {
            group_id, user_id, ..
        }) => Ok((group_id, user_id)),
        Ok(other) => panic!("unexpected response {other:?}"),
        Err(e) => Err(e),
    }
}

fn leave(node: &TestNode, group: Id) {
    let (tx, rx) = unbounded();
    node.client.leave_group(
        group,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).expect("leave reply");
    assert!(matches!(result, Ok(Response::GroupLeave)), "{result:?}");
}

fn wait_for<T>(
    events: &Receiver<ClientEvent>,
    timeout: Duration,
    mut predicate: impl FnMut(&ClientEvent) -> Option<T>,
) -> T {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out waiting for event");
        let event = events.recv_timeout(remaining).expect("event");
        if let Some(out) = predicate(&event) {
            return out;
        }
    }
}

#[test]
fn login_and_peer_handshake() {
    let net = TestNet::new();
    net.server.lock().set_password("letmein");
    let a = net.spawn_node("10.1.1.1:4000");
    let b = net.spawn_node("10.1.1.2:4000");

    let id_a = connect(&a).unwrap();
    let id_b = connect(&b).unwrap();
    assert_ne!(id_a, id_b);
    assert_eq!(a.client.state(), SessionState::Connected);

    let (gid_a, uid_a) = join(&a, "jam", "alice").unwrap();
    let (gid_b, uid_b) = join(&b, "jam", "bob").unwrap();
    assert_eq!(gid_a, gid_b);
    assert_ne!(uid_a, uid_b);

    // both sides must see the handshake complete with the real address
    let addr_of_b = wait_for(&a.events, Duration::from_secs(5), |e| match e {
        ClientEvent::PeerJoin(id, _, user, addr) if id.user == uid_b => {
            assert_eq!(user, "bob");
            Some(*addr)
        }
        _ => None,
    });
    assert_eq!(addr_of_b, b.addr);

    let addr_of_a = wait_for(&b.events, Duration::from_secs(5), |e| match e {
        ClientEvent::PeerJoin(id, _, _, addr) if id.user == uid_a => Some(*addr),
        _ => None,
    });
    assert_eq!(addr_of_a, a.addr);

    assert_eq!(
        a.client.peer_address(aoo_net::PeerId {
            group: gid_a,
            user: uid_b
        }),
        Some(b.addr)
    );

    a.client.quit();
    b.client.quit();
}

#[test]
fn wrong_passwords_are_rejected() {
    let net = TestNet::new();
    net.server.lock().set_password("sesame");
    let a = net.spawn_node("10.2.1.1:4000");

    let err = connect(&a).unwrap_err();
    assert_eq!(err.kind, AooError::WrongPassword);
    assert_eq!(a.client.state(), SessionState::Disconnected);
}

#[test]
fn group_password_and_duplicate_user() {
    let net = TestNet::new();
    let a = net.spawn_node("10.3.1.1:4000");
    let b = net.spawn_node("10.3.1.2:4000");
    connect(&a).unwrap();
    connect(&b).unwrap();

    join_with_pwd(&a, "locked", "secret", "alice", "").unwrap();

    // wrong group password
    let err = join_with_pwd(&b, "locked", "wrong", "bob", "").unwrap_err();
    assert_eq!(err.kind, AooError::WrongPassword);

    // duplicate active user name
    let err = join_with_pwd(&b, "locked", "secret", "alice", "").unwrap_err();
    assert_eq!(err.kind, AooError::UserAlreadyExists);

    // joining twice from the same client is caught locally
    let err = join_with_pwd(&a, "locked", "secret", "alice2", "").unwrap_err();
    assert_eq!(err.kind, AooError::AlreadyGroupMember);

    a.client.quit();
    b.client.quit();
}

#[test]
fn leave_notifies_peers_and_persistent_groups_survive() {
    let net = TestNet::new();
    let gid_persistent = net
        .server
        .lock()
        .add_group("studio", "", None, HostName::default())
        .unwrap();

    let a = net.spawn_node("10.4.1.1:4000");
    let b = net.spawn_node("10.4.1.2:4000");
    connect(&a).unwrap();
    connect(&b).unwrap();

    let (gid, uid_b) = {
        let (gid_a, _) = join(&a, "studio", "alice").unwrap();
        let (gid_b, uid_b) = join(&b, "studio", "bob").unwrap();
        assert_eq!(gid_a, gid_b);
        (gid_a, uid_b)
    };
    assert_eq!(gid, gid_persistent);

    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerJoin(id, ..) if id.user == uid_b).then_some(())
    });

    leave(&b, gid);
    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerLeave(id) if id.user == uid_b).then_some(())
    });

    // a persistent group keeps its id across joins
    let (gid_again, _) = join(&b, "studio", "bob").unwrap();
    assert_eq!(gid_again, gid_persistent);

    a.client.quit();
    b.client.quit();
}

#[test]
fn eject_removes_peers_everywhere() {
    let net = TestNet::new();
    let a = net.spawn_node("10.5.1.1:4000");
    let b = net.spawn_node("10.5.1.2:4000");
    connect(&a).unwrap();
    connect(&b).unwrap();
    let (gid, _uid_a) = join(&a, "jam", "alice").unwrap();
    let (_, uid_b) = join(&b, "jam", "bob").unwrap();

    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerJoin(id, ..) if id.user == uid_b).then_some(())
    });

    net.server.lock().eject_user(gid, uid_b).unwrap();

    wait_for(&b.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::GroupEject(g) if *g == gid).then_some(())
    });
    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerLeave(id) if id.user == uid_b).then_some(())
    });
    assert!(b.client.list_peers().is_empty());

    a.client.quit();
    b.client.quit();
}

#[test]
fn peer_messages_arrive_in_order() {
    let net = TestNet::new();
    let a = net.spawn_node("10.6.1.1:4000");
    let b = net.spawn_node("10.6.1.2:4000");
    connect(&a).unwrap();
    connect(&b).unwrap();
    let (gid, _) = join(&a, "jam", "alice").unwrap();
    let (_, uid_b) = join(&b, "jam", "bob").unwrap();

    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerJoin(id, ..) if id.user == uid_b).then_some(())
    });

    for i in 0..5u8 {
        a.client.send_message(
            MessageTarget::Group(gid),
            PeerMessage {
                data: Metadata::new(1, vec![i; 16]),
                tt: NtpTime::now(),
                reliable: true,
            },
        );
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        wait_for(&b.events, Duration::from_secs(5), |e| match e {
            ClientEvent::PeerMessage { data, .. } => {
                received.push(data.data[0]);
                Some(())
            }
            _ => None,
        });
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);

    a.client.quit();
    b.client.quit();
}

#[test]
fn notifications_and_custom_requests() {
    let net = TestNet::new();
    net.server
        .lock()
        .set_request_handler(Box::new(|_client, flags, data| {
            // echo requests back, uppercased
            let reply: Vec<u8> = data.data.iter().map(|b| b.to_ascii_uppercase()).collect();
            Some((Some(Metadata::new(data.dtype, reply)), flags))
        }));

    let a = net.spawn_node("10.7.1.1:4000");
    let id_a = connect(&a).unwrap();

    // server -> client notification
    net.server
        .lock()
        .notify_client(id_a, &Metadata::new(9, *b"hello"))
        .unwrap();
    wait_for(&a.events, Duration::from_secs(5), |e| match e {
        ClientEvent::Notification(md) => {
            assert_eq!(md.data, b"hello");
            Some(())
        }
        _ => None,
    });

    // client -> server custom request
    let (tx, rx) = unbounded();
    a.client.custom_request(
        Metadata::new(9, *b"abc"),
        0,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ok(Response::Custom { data, .. }) => {
            assert_eq!(data.unwrap().data, b"ABC");
        }
        other => panic!("unexpected {other:?}"),
    }

    a.client.quit();
}

#[test]
fn group_update_fans_out() {
    let net = TestNet::new();
    let a = net.spawn_node("10.8.1.1:4000");
    let b = net.spawn_node("10.8.1.2:4000");
    connect(&a).unwrap();
    connect(&b).unwrap();
    let (gid, uid_a) = join(&a, "jam", "alice").unwrap();
    let (_, uid_b) = join(&b, "jam", "bob").unwrap();
    wait_for(&a.events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::PeerJoin(id, ..) if id.user == uid_b).then_some(())
    });

    let (tx, rx) = unbounded();
    a.client.update_group(
        gid,
        Some(Metadata::new(3, *b"topic")),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ok(Response::GroupUpdate { metadata }) => {
            assert_eq!(metadata.unwrap().data, b"topic");
        }
        other => panic!("unexpected {other:?}"),
    }

    wait_for(&b.events, Duration::from_secs(5), |e| match e {
        ClientEvent::GroupUpdate(g, u, md) if *g == gid && *u == uid_a => {
            assert_eq!(md.as_ref().unwrap().data, b"topic");
            Some(())
        }
        _ => None,
    });

    a.client.quit();
    b.client.quit();
}
