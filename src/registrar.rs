//! In-process registrar and presence server for a [`LoopbackNetwork`].
//!
//! Answers REGISTER with digest authentication, keeps one publication per
//! resource and fans NOTIFYs out to its watchers. It has no clock: bindings
//! and subscriptions live until they are removed with `Expires: 0`.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::subscription::DEFAULT_CONTENT_TYPE;
use crate::{
    DigestChallenge, LoopbackNetwork, LoopbackTransport, MessageBody, SipMessage,
    SipMessageBuilder, SipMethod, SipUri, SubscriptionStatus, Transport, generate_tag,
};

const DEFAULT_EXPIRES: u32 = 3600;

/// Contact registered for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub contact: SipUri,
    pub expires: u32,
}

/// Current state published for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub event: String,
    pub etag: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
struct Watcher {
    resource: SipUri,
    call_id: String,
    event: String,
    subscriber: SipUri,
    subscriber_tag: Option<String>,
    local_tag: String,
    target: SipUri,
    cseq: u32,
}

struct User {
    password: String,
    nonce: String,
}

pub struct LoopbackRegistrar {
    transport: LoopbackTransport,
    domain: String,
    users: HashMap<String, User>,
    bindings: HashMap<String, Binding>,
    publications: HashMap<String, Publication>,
    watchers: HashMap<String, Vec<Watcher>>,
    forced_status: Option<u16>,
}

impl LoopbackRegistrar {
    /// Attaches to `network` as `sip:<domain>`, the fallback route for
    /// every address of the domain without a node of its own.
    pub fn new(network: &LoopbackNetwork, domain: &str) -> Self {
        LoopbackRegistrar {
            transport: network.attach(SipUri::new(domain)),
            domain: domain.to_string(),
            users: HashMap::new(),
            bindings: HashMap::new(),
            publications: HashMap::new(),
            watchers: HashMap::new(),
            forced_status: None,
        }
    }

    pub fn local_uri(&self) -> &SipUri {
        self.transport.local_uri()
    }

    pub fn register_user(&mut self, username: &str, password: &str) {
        self.users.insert(
            username.to_string(),
            User {
                password: password.to_string(),
                nonce: generate_tag(),
            },
        );
    }

    /// Answers every REGISTER with `status` until called with `None`.
    pub fn fail_registrations(&mut self, status: Option<u16>) {
        self.forced_status = status;
    }

    pub fn binding(&self, username: &str) -> Option<&Binding> {
        self.bindings.get(username)
    }

    pub fn publication(&self, resource: &SipUri) -> Option<&Publication> {
        self.publications.get(&resource.address_of_record())
    }

    pub fn watchers(&self, resource: &SipUri) -> usize {
        self.watchers
            .get(&resource.address_of_record())
            .map_or(0, Vec::len)
    }

    /// Handles everything received so far; returns how many messages that was.
    pub fn process(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.transport.recv() {
            handled += 1;
            let Some(method) = message.method() else {
                // Answers to our NOTIFYs
                continue;
            };

            match method {
                SipMethod::Register => self.handle_register(&message),
                SipMethod::Subscribe => self.handle_subscribe(&message),
                SipMethod::Publish => self.handle_publish(&message),
                SipMethod::Invite => {
                    let user = message.to.user.as_deref().unwrap_or_default();
                    let status = if self.users.contains_key(user) { 480 } else { 404 };
                    self.respond(&message, message.response(status));
                }
                SipMethod::Bye | SipMethod::Cancel | SipMethod::Notify => {
                    self.respond(&message, message.response(481))
                }
                SipMethod::Ack => {}
            }
        }
        handled
    }

    fn respond(&mut self, request: &SipMessage, response: SipMessage) {
        if let Err(err) = self.transport.send(&response, &request.reply_target()) {
            warn!(%err, status = ?response.status_code(), "registrar could not answer");
        }
    }

    fn handle_register(&mut self, request: &SipMessage) {
        if let Some(status) = self.forced_status {
            self.respond(request, request.response(status));
            return;
        }

        let username = request.to.user.clone().unwrap_or_default();
        let Some(user) = self.users.get(&username) else {
            self.respond(request, request.response(404));
            return;
        };

        let Some(ref credentials) = request.authorization else {
            let mut challenge = request.response(401);
            challenge.www_authenticate = Some(DigestChallenge::new(&self.domain, &user.nonce));
            self.respond(request, challenge);
            return;
        };

        let verified = credentials.nonce == user.nonce
            && credentials.username == username
            && credentials.verify(&user.password, SipMethod::Register.as_str());
        if !verified {
            info!(user = %username, "registration refused");
            self.respond(request, request.response(403));
            return;
        }

        let expires = request.expires.unwrap_or(DEFAULT_EXPIRES);
        let contact = request.contact.clone().unwrap_or_else(|| request.reply_target());
        if expires == 0 {
            self.bindings.remove(&username);
            info!(user = %username, "binding removed");
        } else {
            info!(user = %username, %contact, expires, "binding stored");
            self.bindings.insert(
                username,
                Binding {
                    contact: contact.clone(),
                    expires,
                },
            );
        }
        let response = request.response(200).with_expires(expires).with_contact(contact);
        self.respond(request, response);
    }

    fn handle_subscribe(&mut self, request: &SipMessage) {
        // In-dialog refreshes are sent to our contact, not to the resource
        let existing = self.take_watcher(&request.call_id);
        let resource = match existing {
            Some(ref watcher) => watcher.resource.clone(),
            None => match request.request_uri() {
                Some(uri) => uri.clone(),
                None => return,
            },
        };
        let key = resource.address_of_record();
        let expires = request.expires.unwrap_or(DEFAULT_EXPIRES);
        let event = request.event.clone().unwrap_or_else(|| "presence".to_string());

        let mut watcher = existing.unwrap_or_else(|| Watcher {
            resource: resource.clone(),
            call_id: request.call_id.clone(),
            event,
            subscriber: request.from.clone(),
            subscriber_tag: request.from_tag.clone(),
            local_tag: generate_tag(),
            target: request.reply_target(),
            cseq: 0,
        });

        let response = request
            .response(200)
            .with_to_tag(&watcher.local_tag)
            .with_expires(expires)
            .with_contact(self.transport.local_uri().clone());
        self.respond(request, response);

        if expires == 0 {
            debug!(resource = %key, "watcher removed");
            self.notify(&mut watcher, SubscriptionStatus::Terminated, None);
            return;
        }

        let body = self
            .publications
            .get(&key)
            .filter(|publication| publication.event == watcher.event)
            .and_then(|publication| publication.body.clone());
        self.notify(&mut watcher, SubscriptionStatus::Active, body);
        self.watchers.entry(key).or_default().push(watcher);
    }

    fn take_watcher(&mut self, call_id: &str) -> Option<Watcher> {
        self.watchers.values_mut().find_map(|watchers| {
            let index = watchers.iter().position(|w| w.call_id == call_id)?;
            Some(watchers.remove(index))
        })
    }

    fn handle_publish(&mut self, request: &SipMessage) {
        let Some(resource) = request.request_uri().cloned() else {
            return;
        };
        let key = resource.address_of_record();
        let expires = request.expires.unwrap_or(DEFAULT_EXPIRES);
        let current = self.publications.get(&key);

        if let Some(ref etag) = request.if_match {
            if current.is_none_or(|publication| &publication.etag != etag) {
                debug!(resource = %key, %etag, "unknown entity tag");
                self.respond(request, request.response(412));
                return;
            }
        }

        if expires == 0 {
            self.publications.remove(&key);
            self.respond(request, request.response(200).with_expires(0));
            self.notify_watchers(&resource, None);
            return;
        }

        let body = request.body.as_ref().and_then(MessageBody::as_text).map(str::to_string);
        let changed = body.is_some();
        let event = request.event.clone().unwrap_or_else(|| "presence".to_string());
        let publication = Publication {
            event,
            etag: generate_tag(),
            body: body.or_else(|| current.and_then(|publication| publication.body.clone())),
        };

        let mut response = request.response(200).with_expires(expires);
        response.etag = Some(publication.etag.clone());
        let notify_body = publication.body.clone();
        info!(resource = %key, etag = %publication.etag, "publication stored");
        self.publications.insert(key, publication);
        self.respond(request, response);

        if changed {
            self.notify_watchers(&resource, notify_body);
        }
    }

    fn notify_watchers(&mut self, resource: &SipUri, body: Option<String>) {
        let mut watchers = self
            .watchers
            .remove(&resource.address_of_record())
            .unwrap_or_default();
        for watcher in &mut watchers {
            self.notify(watcher, SubscriptionStatus::Active, body.clone());
        }
        self.watchers.insert(resource.address_of_record(), watchers);
    }

    fn notify(
        &mut self,
        watcher: &mut Watcher,
        status: SubscriptionStatus,
        body: Option<String>,
    ) {
        watcher.cseq += 1;
        let request = SipMessageBuilder::request(SipMethod::Notify, watcher.target.clone())
            .call_id(&watcher.call_id)
            .cseq(watcher.cseq)
            .from(watcher.resource.clone(), Some(&watcher.local_tag))
            .to(watcher.subscriber.clone(), watcher.subscriber_tag.as_deref())
            .event(&watcher.event)
            .subscription_state(status)
            .body(body.map(|body| MessageBody::text(DEFAULT_CONTENT_TYPE, &body)))
            .build();

        let sent = request.and_then(|request| self.transport.send(&request, &watcher.target));
        if let Err(err) = sent {
            warn!(%err, call_id = %watcher.call_id, "could not notify watcher");
        }
    }
}
