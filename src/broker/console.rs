//! Operator console
//!
//! Interactive command loop on the broker's stdin. A thin adapter over
//! `send`/`broadcast` with the reserved `broker` sender; errors are reported
//! on the console, never raised out of the state engine.

use crate::broker::state::{BrokerState, Sender};
use crate::domain_types::{AgentId, MessageType};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns the console loop reading commands from stdin.
pub fn spawn(state: Arc<BrokerState>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => handle_line(&state, &line),
                    // stdin closed (broker running detached); stop reading.
                    Ok(None) | Err(_) => break,
                }
            }
        }
    })
}

fn handle_line(state: &BrokerState, line: &str) {
    let line = line.trim();
    match line {
        "" => {}
        "/help" => print_help(),
        "/agents" => print_agents(state),
        _ if line.starts_with('@') => send_targeted(state, line),
        _ => broadcast(state, line),
    }
}

fn print_help() {
    println!("comandos:");
    println!("  /help            mostra esta ajuda");
    println!("  /agents          lista os agentes registrados");
    println!("  @<id> <texto>    envia mensagem para um agente");
    println!("  <texto>          broadcast para todos os agentes");
}

fn print_agents(state: &BrokerState) {
    let agents = state.agents_snapshot();
    if agents.is_empty() {
        println!("nenhum agente registrado");
        return;
    }
    for agent in agents {
        println!(
            "  {} ({}) projeto={} visto={}",
            agent.id,
            agent.name,
            agent.project,
            agent.last_seen.format("%H:%M:%S")
        );
    }
}

fn send_targeted(state: &BrokerState, line: &str) {
    let (target, text) = match line[1..].split_once(char::is_whitespace) {
        Some((target, text)) if !text.trim().is_empty() => (target, text.trim()),
        _ => {
            println!("uso: @<id> <texto>");
            return;
        }
    };
    let id = match AgentId::try_new(target.to_string()) {
        Ok(id) => id,
        Err(_) => {
            println!("uso: @<id> <texto>");
            return;
        }
    };
    match state.send(&Sender::Broker, &id, text.to_string(), MessageType::Text) {
        Ok(_) => println!("mensagem enviada para {id}"),
        Err(err) => println!("erro: {err}"),
    }
}

fn broadcast(state: &BrokerState, text: &str) {
    match state.broadcast(&Sender::Broker, text.to_string(), MessageType::Text) {
        Ok(sent_to) => println!("broadcast enviado para {sent_to} agente(s)"),
        Err(err) => println!("erro: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{AgentName, BROKER_DISPLAY_NAME};
    use crate::time_provider::system_time_provider;

    fn state_with(ids: &[&str]) -> BrokerState {
        let state = BrokerState::new(system_time_provider());
        for id in ids {
            state
                .register(
                    AgentId::try_new((*id).to_string()).unwrap(),
                    AgentName::try_new(format!("SP-{id}")).unwrap(),
                    "proj".into(),
                    "/tmp".into(),
                )
                .unwrap();
        }
        state
    }

    #[test]
    fn targeted_command_enqueues_as_operator() {
        let state = state_with(&["alpha"]);
        handle_line(&state, "@alpha revisa o módulo de auth");

        let id = AgentId::try_new("alpha".to_string()).unwrap();
        let batch = state.read(&id, true, 10).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].from, "broker");
        assert_eq!(batch.messages[0].from_name, BROKER_DISPLAY_NAME);
        assert_eq!(batch.messages[0].content, "revisa o módulo de auth");
    }

    #[test]
    fn plain_text_broadcasts_to_all() {
        let state = state_with(&["a", "b"]);
        handle_line(&state, "parem o deploy");

        for id in ["a", "b"] {
            let id = AgentId::try_new(id.to_string()).unwrap();
            assert_eq!(state.read(&id, true, 10).unwrap().messages.len(), 1);
        }
    }

    #[test]
    fn unknown_target_is_reported_not_raised() {
        let state = state_with(&[]);
        // Must not panic; the error is printed locally.
        handle_line(&state, "@ghost oi");
        handle_line(&state, "@");
        handle_line(&state, "/help");
    }
}
