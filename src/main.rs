//! `kvcore-shell`: a line-oriented REPL for manually exercising the
//! engine. Not a management CLI (no stats dump, no administrative
//! surface) — just enough to `open`, `put`/`get`/`del`, and
//! `begin`/`commit`/`abort` a transaction by hand.

use std::io::{self, Write};
use std::sync::Arc;

use kvcore::config::EnvConfig;
use kvcore::db::{Database, DbConfig};
use kvcore::env::{Environment, OpenFlags};
use kvcore::txn::Transaction;

struct Shell {
    env: Arc<Environment>,
    db: Option<Database>,
    txn: Option<Transaction>,
}

impl Shell {
    fn new(home: &str) -> kvcore::DbResult<Self> {
        let env = Environment::open(home, OpenFlags::full(), EnvConfig::default())?;
        Ok(Self { env, db: None, txn: None })
    }

    fn dispatch(&mut self, line: &str) -> kvcore::DbResult<String> {
        let mut parts = line.split_whitespace();
        let cmd = match parts.next() {
            Some(c) => c,
            None => return Ok(String::new()),
        };
        match cmd {
            "open" => {
                let name = parts.next().unwrap_or("default.db");
                self.db = Some(Database::open(self.env.clone(), name, DbConfig::default(), true)?);
                Ok(format!("opened {}", name))
            }
            "begin" => {
                let txn_mgr = self.env.txn_mgr()?.clone();
                self.txn = Some(txn_mgr.begin(None, Default::default())?);
                Ok("transaction begun".into())
            }
            "commit" => match self.txn.take() {
                Some(txn) => {
                    txn.commit()?;
                    Ok("committed".into())
                }
                None => Ok("no open transaction".into()),
            },
            "abort" => match self.txn.take() {
                Some(txn) => {
                    txn.abort()?;
                    Ok("aborted".into())
                }
                None => Ok("no open transaction".into()),
            },
            "put" => {
                let (db, txn) = self.require_db_and_txn()?;
                let key = parts.next().unwrap_or_default();
                let value = parts.next().unwrap_or_default();
                db.put(txn, key.as_bytes(), value.as_bytes())?;
                Ok("ok".into())
            }
            "get" => {
                let (db, txn) = self.require_db_and_txn()?;
                let key = parts.next().unwrap_or_default();
                match db.get(txn, key.as_bytes())? {
                    Some(v) => Ok(String::from_utf8_lossy(&v).into_owned()),
                    None => Ok("(not found)".into()),
                }
            }
            "del" => {
                let (db, txn) = self.require_db_and_txn()?;
                let key = parts.next().unwrap_or_default();
                Ok(db.del(txn, key.as_bytes())?.to_string())
            }
            "checkpoint" => {
                let lsn = self.env.txn_mgr()?.checkpoint()?;
                Ok(format!("checkpoint at {}", lsn))
            }
            "quit" | "exit" => std::process::exit(0),
            other => Ok(format!("unknown command: {}", other)),
        }
    }

    fn require_db_and_txn(&mut self) -> kvcore::DbResult<(&Database, &Transaction)> {
        if self.txn.is_none() {
            let txn_mgr = self.env.txn_mgr()?.clone();
            self.txn = Some(txn_mgr.begin(None, Default::default())?);
        }
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| kvcore::DbError::Inval("no database open; run `open <name>` first".into()))?;
        Ok((db, self.txn.as_ref().unwrap()))
    }
}

fn main() {
    kvcore::init_tracing();
    let home = std::env::args().nth(1).unwrap_or_else(|| "./kvcore-data".to_string());
    let mut shell = match Shell::new(&home) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open environment at {}: {}", home, e);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    loop {
        print!("kvcore> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match shell.dispatch(line) {
            Ok(out) => println!("{}", out),
            Err(e) => println!("error: {}", e),
        }
    }
}
