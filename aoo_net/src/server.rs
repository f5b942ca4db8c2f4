//! The rendezvous server: a TCP session broker with an optional UDP
//! relay.
//!
//! The server owns no sockets. The host accepts TCP connections, calls
//! [`Server::add_client`] with a [`Binding`] for each, feeds received
//! bytes into [`Server::handle_client_data`] and forwards UDP datagrams
//! into [`Server::handle_udp_message`]. All state lives in plain maps;
//! the server is driven from a single thread.

use crate::digest::encrypt_password;
use crate::link::{Binding, MessageStream};
use crate::peer::write_relay_packet;

use aoo_wire::binmsg::MsgType;
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::{
    pattern, read_host, read_metadata, write_addr, write_host, write_metadata, AooError, HostName,
    Id, Metadata, WireError, INVALID_ID, MAX_PACKET_SIZE,
};

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;

/// Login reply flag: this server is willing to relay peer traffic.
pub const SERVER_FLAG_RELAY: i32 = 1;

/// Events surfaced to the hosting process.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientLogin(Id, Result<(), AooError>),
    ClientRemove(Id),
    GroupAdd(Id, String),
    GroupRemove(Id, String),
    /// `(group, user, client)`
    GroupJoin(Id, Id, Id),
    GroupLeave(Id, Id),
}

/// Optional hook deciding custom requests: returns `Some((reply data,
/// flags))` to accept, `None` to decline.
pub type RequestHandler =
    Box<dyn FnMut(Id, i32, &Metadata) -> Option<(Option<Metadata>, i32)> + Send>;

//--------------------------- user/group -----------------------------//

struct User {
    name: String,
    pwd: String,
    id: Id,
    group: Id,
    /// Attached client, or `INVALID_ID` when idle.
    client: Id,
    metadata: Option<Metadata>,
    relay: HostName,
    persistent: bool,
}

impl User {
    fn active(&self) -> bool {
        self.client != INVALID_ID
    }

    fn check_pwd(&self, pwd: &str) -> bool {
        self.pwd.is_empty() || self.pwd == pwd
    }
}

struct Group {
    name: String,
    pwd: String,
    id: Id,
    metadata: Option<Metadata>,
    relay: HostName,
    persistent: bool,
    user_auto_create: bool,
    users: Vec<User>,
    next_user_id: Id,
}

impl Group {
    fn check_pwd(&self, pwd: &str) -> bool {
        self.pwd.is_empty() || self.pwd == pwd
    }

    fn find_user(&self, id: Id) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    fn find_user_mut(&mut self, id: Id) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    fn find_user_by_name(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    fn find_user_by_client(&self, client: Id) -> Option<&User> {
        self.users.iter().find(|u| u.client == client)
    }

    fn next_user_id(&mut self) -> Id {
        // reclaim ids before minting new ones
        for id in 0..self.next_user_id {
            if self.find_user(id).is_none() {
                return id;
            }
        }
        let id = self.next_user_id;
        self.next_user_id += 1;
        id
    }
}

//------------------------- client endpoint --------------------------//

struct ClientEndpoint {
    id: Id,
    binding: Binding,
    stream: MessageStream,
    public_addresses: Vec<SocketAddr>,
    /// `(group, user)` memberships.
    group_users: Vec<(Id, Id)>,
    /// Logged in successfully.
    active: bool,
}

impl ClientEndpoint {
    fn send_packet(&self, data: &[u8]) {
        // the address is irrelevant for stream bindings
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        if let Err(e) = self.binding.send(data, addr) {
            log::warn!("server: send to client {} failed: {e}", self.id);
        }
    }

}

//----------------------------- server -------------------------------//

pub struct Server {
    clients: FxHashMap<Id, ClientEndpoint>,
    next_client_id: Id,
    groups: FxHashMap<Id, Group>,
    next_group_id: Id,
    /// Global password digest; empty = open server.
    password: String,
    allow_relay: bool,
    group_auto_create: bool,
    /// Globally advertised relay endpoint (may be empty).
    relay_addr: HostName,
    request_handler: Option<RequestHandler>,
    events: (Sender<ServerEvent>, Receiver<ServerEvent>),
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            clients: FxHashMap::default(),
            next_client_id: 0,
            groups: FxHashMap::default(),
            next_group_id: 0,
            password: String::new(),
            allow_relay: true,
            group_auto_create: true,
            relay_addr: HostName::default(),
            request_handler: None,
            events: crossbeam_channel::unbounded(),
        }
    }

    pub fn events(&self) -> Receiver<ServerEvent> {
        self.events.1.clone()
    }

    /// Sets the global server password (stored and compared as digest).
    pub fn set_password(&mut self, password: &str) {
        self.password = encrypt_password(password);
    }

    pub fn set_allow_relay(&mut self, allow: bool) {
        self.allow_relay = allow;
    }

    pub fn set_group_auto_create(&mut self, allow: bool) {
        self.group_auto_create = allow;
    }

    pub fn set_relay_host(&mut self, relay: HostName) {
        self.relay_addr = relay;
    }

    pub fn set_request_handler(&mut self, handler: RequestHandler) {
        self.request_handler = Some(handler);
    }

    //----------------------- host-side tables -----------------------//

    /// Creates a persistent group.
    pub fn add_group(
        &mut self,
        name: &str,
        password: &str,
        metadata: Option<Metadata>,
        relay: HostName,
    ) -> Result<Id, AooError> {
        if self.find_group_by_name(name).is_some() {
            return Err(AooError::AlreadyExists);
        }
        let id = self.make_group_id();
        self.groups.insert(
            id,
            Group {
                name: name.to_string(),
                pwd: encrypt_password(password),
                id,
                metadata,
                relay,
                persistent: true,
                user_auto_create: true,
                users: Vec::new(),
                next_user_id: 0,
            },
        );
        let _ = self.events.0.send(ServerEvent::GroupAdd(id, name.to_string()));
        Ok(id)
    }

    /// Removes a group, ejecting all active members.
    pub fn remove_group(&mut self, group_id: Id) -> Result<(), AooError> {
        let group = self.groups.get(&group_id).ok_or(AooError::GroupDoesNotExist)?;
        let members: Vec<Id> = group.users.iter().filter(|u| u.active()).map(|u| u.id).collect();
        for user in members {
            let _ = self.eject_user(group_id, user);
        }
        if let Some(group) = self.groups.remove(&group_id) {
            let _ = self
                .events
                .0
                .send(ServerEvent::GroupRemove(group_id, group.name));
        }
        Ok(())
    }

    /// Creates a persistent user inside a group.
    pub fn add_user(
        &mut self,
        group_id: Id,
        name: &str,
        password: &str,
        metadata: Option<Metadata>,
    ) -> Result<Id, AooError> {
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(AooError::GroupDoesNotExist)?;
        if group.find_user_by_name(name).is_some() {
            return Err(AooError::UserAlreadyExists);
        }
        let id = group.next_user_id();
        group.users.push(User {
            name: name.to_string(),
            pwd: encrypt_password(password),
            id,
            group: group_id,
            client: INVALID_ID,
            metadata,
            relay: HostName::default(),
            persistent: true,
        });
        Ok(id)
    }

    /// Force-removes a user from a group (server-side eject). The
    /// ejected client gets a `group/eject`, every other member the
    /// usual peer-leave.
    pub fn eject_user(&mut self, group_id: Id, user_id: Id) -> Result<(), AooError> {
        let group = self.groups.get(&group_id).ok_or(AooError::GroupDoesNotExist)?;
        let user = group.find_user(user_id).ok_or(AooError::NotFound)?;
        let client_id = user.client;

        if client_id != INVALID_ID {
            if let Some(client) = self.clients.get(&client_id) {
                let mut buf = [0u8; 128];
                if let Ok(len) = write_group_eject(&mut buf, group_id) {
                    client.send_packet(&buf[..len]);
                }
            }
        }
        self.leave_group_internal(group_id, user_id)?;
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.group_users.retain(|gu| *gu != (group_id, user_id));
        }
        Ok(())
    }

    pub fn find_group_by_name(&self, name: &str) -> Option<Id> {
        self.groups.values().find(|g| g.name == name).map(|g| g.id)
    }

    pub fn find_user_in_group(&self, group_id: Id, name: &str) -> Option<Id> {
        self.groups
            .get(&group_id)?
            .find_user_by_name(name)
            .map(|u| u.id)
    }

    /// Pushes an opaque notification to one client.
    pub fn notify_client(&self, client_id: Id, data: &Metadata) -> Result<(), AooError> {
        let client = self.clients.get(&client_id).ok_or(AooError::NotFound)?;
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = write_notification(&mut buf, data)?;
        client.send_packet(&buf[..len]);
        Ok(())
    }

    /// Pushes a notification to every active member of a group (or a
    /// single user if `user != INVALID_ID`).
    pub fn notify_group(&self, group_id: Id, user: Id, data: &Metadata) -> Result<(), AooError> {
        let group = self.groups.get(&group_id).ok_or(AooError::GroupDoesNotExist)?;
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = write_notification(&mut buf, data)?;
        let mut count = 0;
        for member in group.users.iter().filter(|u| u.active()) {
            if user != INVALID_ID && member.id != user {
                continue;
            }
            if let Some(client) = self.clients.get(&member.client) {
                client.send_packet(&buf[..len]);
                count += 1;
            }
        }
        if user != INVALID_ID && count == 0 {
            return Err(AooError::NotFound);
        }
        Ok(())
    }

    //------------------------ client lifetime -----------------------//

    /// Registers a freshly accepted TCP connection.
    pub fn add_client(&mut self, binding: Binding) -> Id {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            id,
            ClientEndpoint {
                id,
                binding,
                stream: MessageStream::default(),
                public_addresses: Vec::new(),
                group_users: Vec::new(),
                active: false,
            },
        );
        log::debug!("server: added client {id}");
        id
    }

    /// Removes a client (socket closed or kicked), leaving all groups.
    pub fn remove_client(&mut self, client_id: Id) -> Result<(), AooError> {
        let client = self.clients.remove(&client_id).ok_or(AooError::NotFound)?;
        for (group, user) in client.group_users {
            if let Err(e) = self.leave_group_internal(group, user) {
                log::error!("server: client {client_id} leave {group}|{user}: {e}");
            }
        }
        let _ = self.events.0.send(ServerEvent::ClientRemove(client_id));
        log::debug!("server: removed client {client_id}");
        Ok(())
    }

    /// Feeds raw TCP bytes from a client; replies go through the
    /// client's binding.
    pub fn handle_client_data(&mut self, client_id: Id, data: &[u8]) -> Result<(), AooError> {
        let client = self.clients.get_mut(&client_id).ok_or(AooError::NotFound)?;
        let mut packets: Vec<Vec<u8>> = Vec::new();
        let result = client
            .stream
            .feed(data, |packet| packets.push(packet.to_vec()));
        if let Err(e) = result {
            log::error!("server: bad stream from client {client_id}: {e}");
            self.remove_client(client_id)?;
            return Err(e);
        }
        for packet in packets {
            if let Err(e) = self.handle_client_packet(client_id, &packet) {
                log::warn!("server: bad packet from client {client_id}: {e}");
            }
        }
        Ok(())
    }

    fn handle_client_packet(&mut self, client_id: Id, data: &[u8]) -> Result<(), AooError> {
        let parsed = pattern::parse(data)?;
        if parsed.msg_type != MsgType::Server {
            return Err(AooError::BadFormat);
        }
        let mut r = OscReader::parse(data)?;
        let verb = &r.pattern()[parsed.onset..];

        if verb == pattern::MSG_PING {
            let mut buf = [0u8; 64];
            let w = OscWriter::new(&mut buf, pattern::CLIENT_PONG, "")?;
            let len = w.len();
            if let Some(client) = self.clients.get(&client_id) {
                client.send_packet(&buf[..len]);
            }
            return Ok(());
        }
        if verb == pattern::MSG_LOGIN {
            return self.handle_login(client_id, &mut r);
        }
        // everything else requires a successful login
        if !self.clients.get(&client_id).is_some_and(|c| c.active) {
            return Err(AooError::NotPermitted);
        }
        match verb {
            pattern::MSG_GROUP_JOIN => self.handle_group_join(client_id, &mut r),
            pattern::MSG_GROUP_LEAVE => self.handle_group_leave(client_id, &mut r),
            pattern::MSG_GROUP_UPDATE => self.handle_group_update(client_id, &mut r),
            pattern::MSG_USER_UPDATE => self.handle_user_update(client_id, &mut r),
            pattern::MSG_REQUEST => self.handle_custom_request(client_id, &mut r),
            _ => {
                log::warn!("server: unknown message {verb}");
                Err(AooError::NotImplemented)
            }
        }
    }

    // /aoo/server/login <token> <version> <pwd> <n_addr> <addr>* <md>
    fn handle_login(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let version = r.i32()? as u32;
        let pwd = r.str()?.to_string();
        let addr_count = r.i32()?;
        let mut addresses = Vec::new();
        for _ in 0..addr_count {
            addresses.push(aoo_wire::read_addr(r)?);
        }
        let _metadata = read_metadata(r)?;

        if !aoo_wire::check_version(version) {
            self.reply_error(client_id, pattern::CLIENT_LOGIN, token, AooError::BadArgument);
            let _ = self
                .events
                .0
                .send(ServerEvent::ClientLogin(client_id, Err(AooError::BadArgument)));
            return Ok(());
        }
        if !self.password.is_empty() && pwd != self.password {
            self.reply_error(
                client_id,
                pattern::CLIENT_LOGIN,
                token,
                AooError::WrongPassword,
            );
            let _ = self
                .events
                .0
                .send(ServerEvent::ClientLogin(client_id, Err(AooError::WrongPassword)));
            return Ok(());
        }

        let flags = if self.allow_relay { SERVER_FLAG_RELAY } else { 0 };
        let client = self.clients.get_mut(&client_id).ok_or(AooError::NotFound)?;
        client.public_addresses = addresses;
        client.active = true;

        // /aoo/client/login <token> <0> <version> <id> <flags> <md>
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut w = OscWriter::new(&mut buf, pattern::CLIENT_LOGIN, "iiiiiib")?;
        w.i32(token)?;
        w.i32(0)?;
        w.i32(aoo_wire::make_version(0) as i32)?;
        w.i32(client_id)?;
        w.i32(flags)?;
        write_metadata(&mut w, None)?;
        let len = w.len();
        client.send_packet(&buf[..len]);

        let _ = self.events.0.send(ServerEvent::ClientLogin(client_id, Ok(())));
        log::info!("server: client {client_id} logged in");
        Ok(())
    }

    // /aoo/server/group/join <token> <gname> <gpwd> <uname> <upwd>
    //     <gmd> <umd> <relay>
    fn handle_group_join(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let group_name = r.str()?.to_string();
        let group_pwd = r.str()?.to_string();
        let user_name = r.str()?.to_string();
        let user_pwd = r.str()?.to_string();
        let group_md = read_metadata(r)?;
        let user_md = read_metadata(r)?;
        let user_relay = read_host(r).unwrap_or_default();

        const REPLY: &str = pattern::CLIENT_GROUP_JOIN;

        // validate against existing tables
        let group_id = match self.find_group_by_name(&group_name) {
            Some(id) => {
                let group = &self.groups[&id];
                if !group.check_pwd(&group_pwd) {
                    self.reply_error(client_id, REPLY, token, AooError::WrongPassword);
                    return Ok(());
                }
                // a client can hold at most one user per group
                if group.find_user_by_client(client_id).is_some() {
                    self.reply_error(client_id, REPLY, token, AooError::AlreadyGroupMember);
                    return Ok(());
                }
                if let Some(user) = group.find_user_by_name(&user_name) {
                    if user.active() {
                        self.reply_error(client_id, REPLY, token, AooError::UserAlreadyExists);
                        return Ok(());
                    }
                    if !user.check_pwd(&user_pwd) {
                        self.reply_error(client_id, REPLY, token, AooError::WrongPassword);
                        return Ok(());
                    }
                } else if !group.user_auto_create {
                    self.reply_error(client_id, REPLY, token, AooError::CannotCreateUser);
                    return Ok(());
                }
                Some(id)
            }
            None => {
                if !self.group_auto_create {
                    self.reply_error(client_id, REPLY, token, AooError::CannotCreateGroup);
                    return Ok(());
                }
                None
            }
        };

        // create the group on demand
        let group_id = match group_id {
            Some(id) => id,
            None => {
                let id = self.make_group_id();
                self.groups.insert(
                    id,
                    Group {
                        name: group_name.clone(),
                        pwd: group_pwd.clone(),
                        id,
                        metadata: group_md.clone(),
                        relay: HostName::default(),
                        persistent: false,
                        user_auto_create: true,
                        users: Vec::new(),
                        next_user_id: 0,
                    },
                );
                let _ = self
                    .events
                    .0
                    .send(ServerEvent::GroupAdd(id, group_name.clone()));
                id
            }
        };

        // find or create the user, and attach the client
        let group = self.groups.get_mut(&group_id).unwrap();
        let user_id = match group.find_user_by_name(&user_name).map(|u| u.id) {
            Some(id) => id,
            None => {
                let id = group.next_user_id();
                group.users.push(User {
                    name: user_name.clone(),
                    pwd: user_pwd.clone(),
                    id,
                    group: group_id,
                    client: INVALID_ID,
                    metadata: user_md.clone(),
                    relay: user_relay.clone(),
                    persistent: false,
                });
                id
            }
        };
        {
            let user = group.find_user_mut(user_id).unwrap();
            user.client = client_id;
            user.relay = user_relay.clone();
            if user_md.is_some() {
                user.metadata = user_md.clone();
            }
        }

        // prefer the group relay over the global one; both may be empty
        let relay = if group.relay.is_valid() {
            group.relay.clone()
        } else {
            self.relay_addr.clone()
        };
        let group_metadata = group.metadata.clone();
        let user_metadata = group.find_user(user_id).unwrap().metadata.clone();

        {
            let client = self.clients.get_mut(&client_id).ok_or(AooError::NotFound)?;
            client.group_users.push((group_id, user_id));

            // reply: /aoo/client/group/join <token> <0> <gid> <gflags>
            //     <uid> <uflags> <gmd> <umd> <pmd> <relay>
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let mut w = OscWriter::new(&mut buf, pattern::CLIENT_GROUP_JOIN, "iiiiiiibibibsi")?;
            w.i32(token)?;
            w.i32(0)?;
            w.i32(group_id)?;
            w.i32(0)?;
            w.i32(user_id)?;
            w.i32(0)?;
            write_metadata(&mut w, group_metadata.as_ref())?;
            write_metadata(&mut w, user_metadata.as_ref())?;
            write_metadata(&mut w, None)?;
            write_host(&mut w, &relay)?;
            let len = w.len();
            client.send_packet(&buf[..len]);
        }

        // after the reply: fan out peer-add in both directions
        self.broadcast_peer_join(group_id, user_id, client_id);
        let _ = self
            .events
            .0
            .send(ServerEvent::GroupJoin(group_id, user_id, client_id));
        log::info!("server: user {user_name} ({user_id}) joined group {group_name} ({group_id})");
        Ok(())
    }

    fn broadcast_peer_join(&mut self, group_id: Id, user_id: Id, client_id: Id) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        let mut notifications: Vec<(Id, Vec<u8>)> = Vec::new();
        {
            let joiner = group.find_user(user_id).unwrap();
            let joiner_client = &self.clients[&client_id];
            for member in group.users.iter().filter(|u| u.active() && u.id != user_id) {
                let Some(member_client) = self.clients.get(&member.client) else {
                    continue;
                };
                let mut buf = [0u8; MAX_PACKET_SIZE];
                // tell the member about the joiner
                if let Ok(len) = write_peer_join(&mut buf, group, joiner, joiner_client) {
                    notifications.push((member.client, buf[..len].to_vec()));
                }
                // and the joiner about the member
                if let Ok(len) = write_peer_join(&mut buf, group, member, member_client) {
                    notifications.push((client_id, buf[..len].to_vec()));
                }
            }
        }
        for (target, packet) in notifications {
            if let Some(client) = self.clients.get(&target) {
                client.send_packet(&packet);
            }
        }
    }

    // /aoo/server/group/leave <token> <group>
    fn handle_group_leave(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let group_id = r.i32()?;

        let Some(group) = self.groups.get(&group_id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_GROUP_LEAVE,
                token,
                AooError::GroupDoesNotExist,
            );
            return Ok(());
        };
        let Some(user_id) = group.find_user_by_client(client_id).map(|u| u.id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_GROUP_LEAVE,
                token,
                AooError::NotGroupMember,
            );
            return Ok(());
        };

        self.leave_group_internal(group_id, user_id)?;

        let client = self.clients.get_mut(&client_id).ok_or(AooError::NotFound)?;
        client.group_users.retain(|gu| *gu != (group_id, user_id));

        let mut buf = [0u8; 128];
        let mut w = OscWriter::new(&mut buf, pattern::CLIENT_GROUP_LEAVE, "ii")?;
        w.i32(token)?;
        w.i32(0)?;
        let len = w.len();
        client.send_packet(&buf[..len]);
        Ok(())
    }

    /// Shared leave path: peer-leave fan-out, user demotion/removal,
    /// group garbage collection.
    fn leave_group_internal(&mut self, group_id: Id, user_id: Id) -> Result<(), AooError> {
        let group = self.groups.get_mut(&group_id).ok_or(AooError::GroupDoesNotExist)?;
        let user = group.find_user_mut(user_id).ok_or(AooError::NotFound)?;
        user.client = INVALID_ID;
        let persistent_user = user.persistent;

        // notify everyone else
        let mut buf = [0u8; 128];
        if let Ok(len) = write_peer_leave(&mut buf, group_id, user_id) {
            for member in group.users.iter().filter(|u| u.active()) {
                if let Some(client) = self.clients.get(&member.client) {
                    client.send_packet(&buf[..len]);
                }
            }
        }

        if !persistent_user {
            group.users.retain(|u| u.id != user_id);
        }
        let remove_group = !group.persistent && group.users.iter().all(|u| !u.active())
            && group.users.iter().all(|u| !u.persistent);
        let group_name = group.name.clone();
        if remove_group {
            self.groups.remove(&group_id);
            let _ = self
                .events
                .0
                .send(ServerEvent::GroupRemove(group_id, group_name));
        }
        let _ = self.events.0.send(ServerEvent::GroupLeave(group_id, user_id));
        Ok(())
    }

    // /aoo/server/group/update <token> <group> <md>
    fn handle_group_update(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let group_id = r.i32()?;
        let metadata = read_metadata(r)?;

        let Some(group) = self.groups.get_mut(&group_id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_GROUP_UPDATE,
                token,
                AooError::GroupDoesNotExist,
            );
            return Ok(());
        };
        let Some(user_id) = group.find_user_by_client(client_id).map(|u| u.id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_GROUP_UPDATE,
                token,
                AooError::NotPermitted,
            );
            return Ok(());
        };
        group.metadata = metadata.clone();

        // notify the other members
        let mut buf = [0u8; MAX_PACKET_SIZE];
        if let Ok(len) = write_group_changed(&mut buf, group_id, user_id, metadata.as_ref()) {
            for member in group.users.iter().filter(|u| u.active() && u.client != client_id) {
                if let Some(client) = self.clients.get(&member.client) {
                    client.send_packet(&buf[..len]);
                }
            }
        }

        // reply with the canonical metadata
        let mut w = OscWriter::new(&mut buf, pattern::CLIENT_GROUP_UPDATE, "iiib")?;
        w.i32(token)?;
        w.i32(0)?;
        write_metadata(&mut w, metadata.as_ref())?;
        let len = w.len();
        if let Some(client) = self.clients.get(&client_id) {
            client.send_packet(&buf[..len]);
        }
        Ok(())
    }

    // /aoo/server/user/update <token> <group> <md>
    fn handle_user_update(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let group_id = r.i32()?;
        let metadata = read_metadata(r)?;

        let Some(group) = self.groups.get_mut(&group_id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_USER_UPDATE,
                token,
                AooError::GroupDoesNotExist,
            );
            return Ok(());
        };
        let Some(user_id) = group.find_user_by_client(client_id).map(|u| u.id) else {
            self.reply_error(
                client_id,
                pattern::CLIENT_USER_UPDATE,
                token,
                AooError::NotPermitted,
            );
            return Ok(());
        };
        if let Some(user) = group.find_user_mut(user_id) {
            user.metadata = metadata.clone();
        }

        // notify the peers
        let mut buf = [0u8; MAX_PACKET_SIZE];
        if let Ok(len) = write_peer_changed(&mut buf, group_id, user_id, metadata.as_ref()) {
            for member in group.users.iter().filter(|u| u.active() && u.id != user_id) {
                if let Some(client) = self.clients.get(&member.client) {
                    client.send_packet(&buf[..len]);
                }
            }
        }

        let mut w = OscWriter::new(&mut buf, pattern::CLIENT_USER_UPDATE, "iiib")?;
        w.i32(token)?;
        w.i32(0)?;
        write_metadata(&mut w, metadata.as_ref())?;
        let len = w.len();
        if let Some(client) = self.clients.get(&client_id) {
            client.send_packet(&buf[..len]);
        }
        Ok(())
    }

    // /aoo/server/request <token> <flags> <md>
    fn handle_custom_request(&mut self, client_id: Id, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let flags = r.i32()?;
        let data = read_metadata(r)?.ok_or(AooError::BadFormat)?;

        let decision = self
            .request_handler
            .as_mut()
            .and_then(|handler| handler(client_id, flags, &data));
        match decision {
            Some((reply, reply_flags)) => {
                let mut buf = [0u8; MAX_PACKET_SIZE];
                let mut w = OscWriter::new(&mut buf, pattern::CLIENT_REQUEST, "iiiib")?;
                w.i32(token)?;
                w.i32(0)?;
                w.i32(reply_flags)?;
                write_metadata(&mut w, reply.as_ref())?;
                let len = w.len();
                if let Some(client) = self.clients.get(&client_id) {
                    client.send_packet(&buf[..len]);
                }
            }
            None => {
                self.reply_error(
                    client_id,
                    pattern::CLIENT_REQUEST,
                    token,
                    AooError::UnhandledRequest,
                );
            }
        }
        Ok(())
    }

    fn reply_error(&self, client_id: Id, reply_pattern: &str, token: Id, error: AooError) {
        let Some(client) = self.clients.get(&client_id) else {
            return;
        };
        let mut buf = [0u8; 512];
        let result = (|| -> Result<usize, WireError> {
            let mut w = OscWriter::new(&mut buf, reply_pattern, "iiis")?;
            w.i32(token)?;
            w.i32(error.code())?;
            w.i32(0)?; // system error code
            w.str(&error.to_string())?;
            Ok(w.len())
        })();
        match result {
            Ok(len) => client.send_packet(&buf[..len]),
            Err(e) => log::error!("server: error reply: {e}"),
        }
    }

    fn make_group_id(&mut self) -> Id {
        let id = self.next_group_id;
        self.next_group_id += 1;
        id
    }

    //---------------------------- UDP -------------------------------//

    /// Handles a datagram on the server's UDP port. `reply` sends
    /// datagrams back out of that port.
    pub fn handle_udp_message(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
        reply: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> Result<(), AooError> {
        let parsed = pattern::parse(data)?;
        match parsed.msg_type {
            MsgType::Relay => self.handle_relay(data, addr, reply),
            MsgType::Server => {
                let r = OscReader::parse(data)?;
                let verb = &r.pattern()[parsed.onset..];
                match verb {
                    pattern::MSG_PING => {
                        let mut buf = [0u8; 64];
                        let w = OscWriter::new(&mut buf, pattern::CLIENT_PONG, "")?;
                        let len = w.len();
                        reply(&buf[..len], addr);
                        Ok(())
                    }
                    pattern::MSG_QUERY => {
                        // echo the observed public address, unmapped
                        let mut buf = [0u8; 256];
                        let mut w = OscWriter::new(&mut buf, pattern::CLIENT_QUERY, "si")?;
                        write_addr(&mut w, aoo_wire::unmapped(addr))?;
                        let len = w.len();
                        reply(&buf[..len], addr);
                        Ok(())
                    }
                    _ => {
                        log::warn!("server: unknown UDP message {verb}");
                        Err(AooError::NotImplemented)
                    }
                }
            }
            _ => Err(AooError::BadFormat),
        }
    }

    /// Forwards a relayed datagram, rewriting the embedded address to
    /// the sender's observed address.
    fn handle_relay(
        &self,
        data: &[u8],
        addr: SocketAddr,
        reply: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> Result<(), AooError> {
        if !self.allow_relay {
            // silently dropped by design: relay may be disabled
            log::trace!("server: ignoring relay message from {addr}");
            return Ok(());
        }
        let source = aoo_wire::unmapped(addr);
        let (destination, packet) = crate::peer::read_relay_packet(data)?;
        if aoo_wire::is_ipv4_mapped(&destination) {
            log::debug!("server: relay destination must not be IPv4-mapped");
            return Ok(());
        }
        // rewrite with the observed source and emit exactly the bytes
        // the rewrite produced
        let mut buf = [0u8; MAX_PACKET_SIZE + 32];
        let len = write_relay_packet(&mut buf, &packet, source)?;
        reply(&buf[..len], destination);
        Ok(())
    }
}

//------------------------- wire helpers -----------------------------//

// /aoo/client/peer/join <gname> <gid> <uname> <uid> <version> <flags>
//     <n_addr> <addr>* <md> <relay>
fn write_peer_join(
    buf: &mut [u8],
    group: &Group,
    user: &User,
    client: &ClientEndpoint,
) -> Result<usize, WireError> {
    let mut tags = arrayvec::ArrayString::<64>::new();
    tags.try_push_str("sisiiii").map_err(|_| WireError::Overflow)?;
    for _ in &client.public_addresses {
        tags.try_push_str("si").map_err(|_| WireError::Overflow)?;
    }
    tags.try_push_str("ibsi").map_err(|_| WireError::Overflow)?;

    let mut w = OscWriter::new(buf, pattern::CLIENT_PEER_JOIN, &tags)?;
    w.str(&group.name)?;
    w.i32(group.id)?;
    w.str(&user.name)?;
    w.i32(user.id)?;
    w.i32(aoo_wire::make_version(0) as i32)?;
    w.i32(0)?; // flags
    w.i32(client.public_addresses.len() as i32)?;
    for addr in &client.public_addresses {
        write_addr(&mut w, *addr)?;
    }
    write_metadata(&mut w, user.metadata.as_ref())?;
    write_host(&mut w, &user.relay)?;
    Ok(w.len())
}

// /aoo/client/peer/leave <gid> <uid>
fn write_peer_leave(buf: &mut [u8], group: Id, user: Id) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::CLIENT_PEER_LEAVE, "ii")?;
    w.i32(group)?;
    w.i32(user)?;
    Ok(w.len())
}

// /aoo/client/group/eject <gid>
fn write_group_eject(buf: &mut [u8], group: Id) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::CLIENT_GROUP_EJECT, "i")?;
    w.i32(group)?;
    Ok(w.len())
}

// /aoo/client/group/changed <gid> <uid> <md>
fn write_group_changed(
    buf: &mut [u8],
    group: Id,
    user: Id,
    metadata: Option<&Metadata>,
) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::CLIENT_GROUP_CHANGED, "iiib")?;
    w.i32(group)?;
    w.i32(user)?;
    write_metadata(&mut w, metadata)?;
    Ok(w.len())
}

// /aoo/client/peer/changed <gid> <uid> <md>
fn write_peer_changed(
    buf: &mut [u8],
    group: Id,
    user: Id,
    metadata: Option<&Metadata>,
) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::CLIENT_PEER_CHANGED, "iiib")?;
    w.i32(group)?;
    w.i32(user)?;
    write_metadata(&mut w, metadata)?;
    Ok(w.len())
}

// /aoo/client/msg <md>
fn write_notification(buf: &mut [u8], data: &Metadata) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::CLIENT_MESSAGE, "ib")?;
    write_metadata(&mut w, Some(data))?;
    Ok(w.len())
}
