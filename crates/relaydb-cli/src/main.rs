//! Interactive client for the relaydb cluster.
//!
//! Speaks the framed client protocol: one CLIENT_REQUEST per statement,
//! one CLIENT_REPLY back on the same connection. Supports a one-shot
//! `--query` mode and a rustyline shell with history.

use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::net::TcpStream;

use relaydb_cluster::frame::{read_frame, write_frame};
use relaydb_cluster::message::{ClientRequestPayload, CLIENT_SENDER};
use relaydb_cluster::{generate_txn_id, ClientReply, Envelope, MessageKind};

#[derive(Parser, Debug)]
#[command(name = "relaydb")]
#[command(about = "relaydb client")]
struct Cli {
    /// Node to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7001)]
    port: u16,

    /// Run a single statement and exit.
    #[arg(long)]
    query: Option<String>,

    /// Print raw JSON replies instead of formatted output.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    if let Some(query) = &cli.query {
        return match send_statement(&addr, query).await {
            Ok(reply) => {
                print_reply(&reply, cli.json);
                if reply.ok {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    run_shell(&addr, cli.json).await
}

async fn run_shell(addr: &str, json: bool) -> ExitCode {
    println!("relaydb shell — connected to {addr}");
    println!("type a SQL statement per line; 'exit' to quit");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to start shell: {e}");
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("relaydb> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                match send_statement(addr, &line).await {
                    Ok(reply) => print_reply(&reply, json),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

async fn send_statement(addr: &str, stmt: &str) -> Result<ClientReply, String> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect {addr}: {e}"))?;

    let payload = ClientRequestPayload {
        txn_id: generate_txn_id(),
        statement: stmt.to_string(),
    };
    let envelope = Envelope::new(CLIENT_SENDER, MessageKind::ClientRequest, &payload)
        .map_err(|e| e.to_string())?;
    write_frame(&mut stream, &envelope)
        .await
        .map_err(|e| e.to_string())?;

    let reply = read_frame(&mut stream)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "connection closed without a reply".to_string())?;
    if !reply.verify() {
        return Err("reply failed checksum verification".to_string());
    }
    reply.decode::<ClientReply>().map_err(|e| e.to_string())
}

fn print_reply(reply: &ClientReply, json: bool) {
    if json {
        match serde_json::to_string_pretty(reply) {
            Ok(raw) => println!("{raw}"),
            Err(e) => eprintln!("error: {e}"),
        }
        return;
    }

    if !reply.ok {
        if let Some(error) = &reply.error {
            println!("✗ {} — {} (txn {})", error.code, error.message, reply.txn_id);
        } else {
            println!("✗ failed (txn {})", reply.txn_id);
        }
        return;
    }

    match (&reply.rows, reply.affected_rows) {
        (Some(rows), _) => {
            for row in rows {
                println!("{}", row.join(" | "));
            }
            println!("({} row(s), node {}, txn {})", rows.len(), reply.node_id, reply.txn_id);
        }
        (None, Some(affected)) => {
            println!("ok — {affected} row(s) affected (node {}, txn {})", reply.node_id, reply.txn_id);
        }
        (None, None) => println!("ok (node {}, txn {})", reply.node_id, reply.txn_id),
    }
    let _ = io::stdout().flush();
}
