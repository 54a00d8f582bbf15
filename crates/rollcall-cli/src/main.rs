use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a face at the camera and enroll it
    Enroll {
        /// Student ID (unique)
        student_id: String,
        /// Display name
        name: String,
        /// Capture device; defaults to the daemon's configured camera
        #[arg(long)]
        device: Option<String>,
    },
    /// Remove an enrolled student
    Remove { student_id: String },
    /// List enrolled students
    List,
    /// Manage rosters (subjects / courses)
    Scope {
        #[command(subcommand)]
        command: ScopeCommands,
    },
    /// Start or stop attendance scanning
    Scan {
        #[command(subcommand)]
        command: ScanCommands,
    },
    /// Show daemon and scan status
    Status,
    /// List or mark attendance
    Attendance {
        #[command(subcommand)]
        command: AttendanceCommands,
    },
    /// List V4L2 capture devices on this machine
    Devices,
}

#[derive(Subcommand)]
enum ScopeCommands {
    /// Create a roster, or rename an existing one
    Create { id: String, name: String },
    /// Add one or more students to a roster
    Add {
        scope_id: String,
        #[arg(required = true)]
        student_ids: Vec<String>,
    },
    /// List rosters
    List,
}

#[derive(Subcommand)]
enum ScanCommands {
    /// Start scanning a roster; use "*" for every enrolled student
    Start {
        scope_id: String,
        /// Capture device; defaults to the daemon's configured camera
        #[arg(long)]
        device: Option<String>,
    },
    /// Stop scanning and release the camera
    Stop,
}

#[derive(Subcommand)]
enum AttendanceCommands {
    /// List attendance records
    List {
        /// Day to list, YYYY-MM-DD (UTC)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        student: Option<String>,
    },
    /// Mark a student present by hand
    Mark {
        student_id: String,
        name: String,
        /// Defaults to "General"
        #[arg(long)]
        subject: Option<String>,
    },
}

#[zbus::proxy(
    interface = "org.rollcall.Scanner1",
    default_service = "org.rollcall.Scanner1",
    default_path = "/org/rollcall/Scanner1"
)]
trait Scanner {
    async fn enroll(&self, student_id: &str, name: &str, device: &str) -> zbus::Result<String>;
    async fn remove(&self, student_id: &str) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn create_scope(&self, id: &str, name: &str) -> zbus::Result<String>;
    async fn add_to_scope(&self, scope_id: &str, student_ids: &[String]) -> zbus::Result<u32>;
    async fn list_scopes(&self) -> zbus::Result<String>;
    async fn start_scan(&self, scope_id: &str, device: &str) -> zbus::Result<String>;
    async fn stop_scan(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn mark_attendance(
        &self,
        student_id: &str,
        name: &str,
        subject: &str,
    ) -> zbus::Result<String>;
    async fn list_attendance(
        &self,
        date: &str,
        subject: &str,
        student_id: &str,
    ) -> zbus::Result<String>;
}

/// Re-indent a JSON reply for the terminal; non-JSON is passed through.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

async fn connect(system: bool) -> Result<ScannerProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    ScannerProxy::new(&conn)
        .await
        .context("rollcalld is not reachable; is the daemon running?")
}

fn print_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Enumerates local hardware; works without the daemon.
        Commands::Devices => print_devices(),
        command => run(command, &connect(cli.system).await?).await?,
    }

    Ok(())
}

async fn run(command: Commands, proxy: &ScannerProxy<'_>) -> Result<()> {
    match command {
        Commands::Enroll {
            student_id,
            name,
            device,
        } => {
            println!("Look at the camera...");
            let reply = proxy
                .enroll(&student_id, &name, device.as_deref().unwrap_or(""))
                .await?;
            println!("{}", pretty(&reply));
        }
        Commands::Remove { student_id } => {
            if proxy.remove(&student_id).await? {
                println!("Removed {student_id}");
            } else {
                println!("{student_id} was not enrolled");
            }
        }
        Commands::List => println!("{}", pretty(&proxy.list_identities().await?)),
        Commands::Scope { command } => match command {
            ScopeCommands::Create { id, name } => {
                println!("{}", pretty(&proxy.create_scope(&id, &name).await?))
            }
            ScopeCommands::Add {
                scope_id,
                student_ids,
            } => {
                let added = proxy.add_to_scope(&scope_id, &student_ids).await?;
                let already = student_ids.len().saturating_sub(added as usize);
                println!("Added {added} to {scope_id} ({already} already on it)");
            }
            ScopeCommands::List => println!("{}", pretty(&proxy.list_scopes().await?)),
        },
        Commands::Scan { command } => match command {
            ScanCommands::Start { scope_id, device } => {
                let reply = proxy
                    .start_scan(&scope_id, device.as_deref().unwrap_or(""))
                    .await?;
                println!("{}", pretty(&reply))
            }
            ScanCommands::Stop => {
                proxy.stop_scan().await?;
                println!("Scanning stopped");
            }
        },
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
        Commands::Attendance { command } => match command {
            AttendanceCommands::List {
                date,
                subject,
                student,
            } => {
                let reply = proxy
                    .list_attendance(
                        date.as_deref().unwrap_or(""),
                        subject.as_deref().unwrap_or(""),
                        student.as_deref().unwrap_or(""),
                    )
                    .await?;
                println!("{}", pretty(&reply));
            }
            AttendanceCommands::Mark {
                student_id,
                name,
                subject,
            } => {
                let reply = proxy
                    .mark_attendance(&student_id, &name, subject.as_deref().unwrap_or(""))
                    .await?;
                println!("{}", pretty(&reply));
            }
        },
        Commands::Devices => print_devices(),
    }
    Ok(())
}
