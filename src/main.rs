// main.rs - Interactive loopback demo: two user agents and a registrar in one process

use rs_sipcore::{
    AccountConfig, CallHandle, CallState, Core, CoreEvent, LoopbackNetwork, LoopbackRegistrar,
    Reason, SipUri, SubscribePolicy, SubscriptionDirection, SubscriptionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DOMAIN: &str = "example.com";

fn user_agent(network: &LoopbackNetwork, user: &str) -> Result<Core, Box<dyn std::error::Error>> {
    let identity = SipUri::with_user(user, DOMAIN);
    let core = Core::builder()
        .identity(&identity.to_string())
        .user_agent("rs_sipcore demo/1.0")
        .subscribe_policy(SubscribePolicy::Accept)
        .transport(network.attach(identity))
        .account(AccountConfig::new(user, DOMAIN).password(user))
        .build()?;

    let name = user.to_string();
    core.events().on(move |event: &CoreEvent| match event {
        CoreEvent::CallStateChanged { call_id, state, reason, .. } => {
            info!(agent = %name, %call_id, ?state, ?reason, "call")
        }
        CoreEvent::RegistrationStateChanged { state, reason, .. } => {
            info!(agent = %name, ?state, ?reason, "registration")
        }
        CoreEvent::NotifyReceived { body, .. } => info!(agent = %name, ?body, "notify"),
        other => info!(agent = %name, event = ?other, "event"),
    });
    Ok(core)
}

fn ringing(core: &Core) -> Option<CallHandle> {
    core.calls()
        .find(|call| call.state() == CallState::IncomingReceived)
        .map(|call| CallHandle(call.id().clone()))
}

// Publishes to the presence server, then tells direct watchers
fn publish(core: &mut Core, note: &str) -> rs_sipcore::Result<()> {
    let resource = core.identity().to_string();
    core.publish(&resource, "presence", note, 600)?;

    let watchers: Vec<_> = core
        .subscriptions()
        .filter(|s| {
            s.direction() == SubscriptionDirection::Incoming
                && s.state() == SubscriptionState::Active
        })
        .map(|s| s.id().clone())
        .collect();
    for watcher in &watchers {
        core.notify(watcher, note)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("rs_sipcore loopback demo");
    println!("========================\n");

    let network = LoopbackNetwork::new();
    let mut registrar = LoopbackRegistrar::new(&network, DOMAIN);
    registrar.register_user("alice", "alice");
    registrar.register_user("bob", "bob");

    let mut alice = user_agent(&network, "alice")?;
    let mut bob = user_agent(&network, "bob")?;
    alice.start()?;
    bob.start()?;

    let mut calls: Vec<CallHandle> = Vec::new();
    let mut reader = BufReader::new(tokio::io::stdin()).lines();

    println!("Commands:");
    println!("  call <user>       - alice calls sip:<user>@{}", DOMAIN);
    println!("  answer            - bob answers the last call");
    println!("  hold | resume     - alice pauses or resumes the last call");
    println!("  hangup            - alice ends the last call");
    println!("  decline           - bob declines the last call");
    println!("  publish <note>    - alice publishes her presence and notifies watchers");
    println!("  watch             - bob subscribes to alice's presence");
    println!("  offline | online  - toggle alice's network");
    println!("  status            - show both agents");
    println!("  quit              - exit\n");

    loop {
        let wait = alice.next_iterate_interval().min(bob.next_iterate_interval());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                alice.iterate();
                bob.iterate();
                registrar.process();
            }
            line = reader.next_line() => {
                let Some(line) = line? else { break };
                let parts: Vec<&str> = line.split_whitespace().collect();
                let result = match parts.as_slice() {
                    ["call", user] => alice
                        .invite(&format!("sip:{}@{}", user, DOMAIN))
                        .map(|call| calls.push(call)),
                    ["answer"] => match ringing(&bob) {
                        Some(call) => bob.accept(&call),
                        None => {
                            println!("no incoming call");
                            Ok(())
                        }
                    },
                    ["decline"] => match ringing(&bob) {
                        Some(call) => bob.decline(&call, Reason::Declined),
                        None => {
                            println!("no incoming call");
                            Ok(())
                        }
                    },
                    ["hold"] => calls.last().map_or(Ok(()), |call| alice.pause(call)),
                    ["resume"] => calls.last().map_or(Ok(()), |call| alice.resume(call)),
                    ["hangup"] => calls.last().map_or(Ok(()), |call| alice.terminate(call)),
                    ["publish", note @ ..] => publish(&mut alice, &note.join(" ")),
                    ["watch"] => bob
                        .subscribe(&format!("sip:alice@{}", DOMAIN), "presence", 600)
                        .map(|_| ()),
                    ["offline" | "online"] => {
                        alice.set_network_reachable(parts[0] == "online");
                        Ok(())
                    }
                    ["status"] => {
                        for core in [&alice, &bob] {
                            println!(
                                "{}: {:?}, {} call(s), reachable: {}",
                                core.identity(),
                                core.global_state(),
                                core.calls().count(),
                                core.is_network_reachable()
                            );
                        }
                        Ok(())
                    }
                    ["quit"] => break,
                    [] => Ok(()),
                    _ => {
                        println!("unknown command: {}", line);
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    println!("error: {}", err);
                }
            }
        }
    }

    alice.stop();
    bob.stop();
    registrar.process();
    println!("Goodbye!");
    Ok(())
}
