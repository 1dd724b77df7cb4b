//! hive - multi-agent orchestrator CLI for tmux-hosted LLM workers.

use std::process;
use std::sync::Arc;

use beehive::cli::{Cli, Commands, DaemonCommands, TaskCommands};
use beehive::commands::{self, Output};
use beehive::config::HiveConfig;
use beehive::tmux::{Multiplexer, TmuxMultiplexer};
use clap::Parser;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    let config = match HiveConfig::load(cli.hive_dir) {
        Ok(config) => config,
        Err(e) => fail(&e, human),
    };

    init_tracing(&config);

    let mux: Arc<dyn Multiplexer> = Arc::new(TmuxMultiplexer::new());
    if let Err(e) = run_command(cli.command, &config, mux, human) {
        fail(&e, human);
    }
}

/// Print the error (human or machine form) and exit with its code.
fn fail(error: &beehive::Error, human: bool) -> ! {
    if human {
        eprintln!("Error: {error} ({})", error.kind());
    } else {
        eprintln!(
            r#"{{"error": {}, "kind": "{}"}}"#,
            serde_json::to_string(&error.to_string()).unwrap_or_else(|_| "\"\"".to_string()),
            error.kind()
        );
    }
    process::exit(error.exit_code());
}

fn init_tracing(config: &HiveConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

fn run_command(
    command: Commands,
    config: &HiveConfig,
    mux: Arc<dyn Multiplexer>,
    human: bool,
) -> beehive::Result<()> {
    match command {
        Commands::Init { force } => {
            output(&commands::init(config, mux, force)?, human);
        }

        Commands::InjectRoles { bee } => {
            let bee = bee.as_deref().map(beehive::models::BeeName::parse).transpose()?;
            output(&commands::inject_roles(config, mux, bee)?, human);
        }

        Commands::StartTask { text } => {
            output(&commands::start_task(config, mux, &text)?, human);
        }

        Commands::Task { command } => match command {
            TaskCommands::Create {
                title,
                description,
                priority,
                assignee,
                parent,
                depends_on,
                from,
            } => {
                output(
                    &commands::task_create(
                        config,
                        mux,
                        &title,
                        &description,
                        &priority,
                        assignee.as_deref(),
                        parent.as_deref(),
                        &depends_on,
                        &from,
                    )?,
                    human,
                );
            }

            TaskCommands::List {
                status,
                assignee,
                priority,
            } => {
                output(
                    &commands::task_list(
                        config,
                        status.as_deref(),
                        assignee.as_deref(),
                        priority.as_deref(),
                    )?,
                    human,
                );
            }

            TaskCommands::Details { id } => {
                output(&commands::task_details(config, &id)?, human);
            }

            TaskCommands::Assign {
                id,
                assignee,
                auto,
                assigner,
                role,
                note,
            } => {
                output(
                    &commands::task_assign(
                        config,
                        mux,
                        &id,
                        assignee.as_deref(),
                        auto,
                        &assigner,
                        &role,
                        note.as_deref(),
                    )?,
                    human,
                );
            }

            TaskCommands::Status {
                id,
                status,
                actor,
                note,
            } => {
                output(
                    &commands::task_status(config, mux, &id, &status, &actor, note.as_deref())?,
                    human,
                );
            }

            TaskCommands::Message {
                to,
                content,
                task_id,
                from,
            } => {
                output(
                    &commands::send_message(
                        config,
                        mux,
                        &commands::SendArgs {
                            to: &to,
                            content: &content,
                            from: &from,
                            message_type: "conversation",
                            subject: None,
                            task_id: task_id.as_deref(),
                            priority: "normal",
                            reply_to: None,
                            dry_run: false,
                        },
                    )?,
                    human,
                );
            }

            TaskCommands::Stats => {
                output(&commands::task_stats(config)?, human);
            }
        },

        Commands::Send {
            to,
            content,
            from,
            message_type,
            subject,
            task_id,
            priority,
            reply_to,
            dry_run,
        } => {
            output(
                &commands::send_message(
                    config,
                    mux,
                    &commands::SendArgs {
                        to: &to,
                        content: &content,
                        from: &from,
                        message_type: &message_type,
                        subject: subject.as_deref(),
                        task_id: task_id.as_deref(),
                        priority: &priority,
                        reply_to,
                        dry_run,
                    },
                )?,
                human,
            );
        }

        Commands::Heartbeat { bee } => {
            output(&commands::heartbeat(config, mux, &bee)?, human);
        }

        Commands::Status => {
            output(&commands::status(config, mux)?, human);
        }

        Commands::Logs { bee, lines } => {
            output(&commands::logs(config, mux, bee.as_deref(), lines)?, human);
        }

        Commands::Attach => {
            let code = commands::attach(config)?;
            process::exit(code);
        }

        Commands::Remind { bee } => {
            output(&commands::remind(config, mux, bee.as_deref())?, human);
        }

        Commands::Daemon { command } => match command {
            DaemonCommands::Start => {
                output(&commands::daemon_start(config)?, human);
            }
            DaemonCommands::Stop => {
                output(&commands::daemon_stop(config)?, human);
            }
            DaemonCommands::Status => {
                output(&commands::daemon_status(config)?, human);
            }
            DaemonCommands::Restart => {
                commands::daemon_stop(config)?;
                output(&commands::daemon_start(config)?, human);
            }
            DaemonCommands::Remind { bee } => {
                output(&commands::remind(config, mux, bee.as_deref())?, human);
            }
            DaemonCommands::Logs { n } => {
                output(&commands::daemon_logs(config, n)?, human);
            }
            DaemonCommands::Run => {
                commands::daemon_run(config, mux)?;
            }
        },

        Commands::Stop { yes } => {
            if !yes && !commands::confirm("Stop the hive?") {
                if human {
                    println!("Aborted.");
                } else {
                    println!(r#"{{"stopped": false, "aborted": true}}"#);
                }
                return Ok(());
            }
            output(&commands::stop(config, mux)?, human);
        }
    }

    Ok(())
}
