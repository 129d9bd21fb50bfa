//! Scripted probe for a running server.
//!
//! Registers `alice`, sends one move twice, then a stale move reusing its
//! sequence number, and prints every reply before unregistering. Usage: `test_client [addr]`.

use shared::framing::{read_envelope, write_envelope, FrameConfig};
use shared::{Envelope, Packet, DEFAULT_PORT};
use tokio::net::TcpStream;

struct Probe {
    stream: TcpStream,
    config: FrameConfig,
    next_call_id: u64,
}

impl Probe {
    async fn call(&mut self, packet: Packet) -> Result<Packet, Box<dyn std::error::Error>> {
        self.next_call_id += 1;
        println!("-> {:?}", packet);
        let request = Envelope::new(self.next_call_id, packet);
        write_envelope(&mut self.stream, &request, &self.config).await?;

        let reply = read_envelope(&mut self.stream, &self.config).await?;
        if reply.call_id != request.call_id {
            return Err(format!(
                "reply for call {} while waiting for {}",
                reply.call_id, request.call_id
            )
            .into());
        }
        println!("<- {:?}", reply.packet);
        Ok(reply.packet)
    }
}

fn update(row: i32, col: i32, seq_num: u64) -> Packet {
    Packet::UpdatePlayerState {
        player_id: "alice".to_string(),
        row,
        col,
        seq_num,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));

    let stream = TcpStream::connect(&addr).await?;
    println!("Connected to {}", stream.peer_addr()?);
    let mut probe = Probe {
        stream,
        config: FrameConfig::default(),
        next_call_id: 0,
    };

    let registered = probe
        .call(Packet::RegisterPlayer {
            player_id: "alice".to_string(),
        })
        .await?;
    // Continue after whatever an earlier run left behind.
    let seq = match registered {
        Packet::RegisterReply { ok: true, last_seq } => last_seq + 1,
        other => return Err(format!("registration refused: {:?}", other).into()),
    };

    let first = probe.call(update(3, 4, seq)).await?;
    let resend = probe.call(update(3, 4, seq)).await?;
    let stale = probe.call(update(5, 5, seq)).await?;

    let position = match probe.call(Packet::GetGameState).await? {
        Packet::GameState { players } => players.get("alice").map(|p| p.position()),
        _ => None,
    };

    probe
        .call(Packet::UnregisterPlayer {
            player_id: "alice".to_string(),
        })
        .await?;

    let passed = first == Packet::MoveReply { applied: true }
        && resend == Packet::MoveReply { applied: false }
        && stale == Packet::MoveReply { applied: false }
        && position == Some((3, 4));

    println!(
        "Exactly-once check {}",
        if passed { "passed" } else { "FAILED" }
    );
    Ok(())
}
