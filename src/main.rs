use std::io::Write as _;

use anyhow::Result;
use biblechat::{AppConfig, AppState};
use tokio::io::{AsyncBufReadExt, BufReader};

// The CLI is a single-user harness over the library.
const USER_ID: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env()?;
    let language = config.language.clone();
    let state = AppState::init(&config).await?;

    // Resume the most recent session or start a fresh one.
    let mut session_id = match state.sessions.load_sessions(USER_ID).await?.into_iter().next() {
        Some(session) => session.id,
        None => state.sessions.create_session(USER_ID).await?.id,
    };
    log::info!("Using session {}", session_id);

    println!("biblechat: type a message to chat, or /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["/quit"] | ["/exit"] => break,
            ["/help"] => print_help(),
            ["/versions"] => {
                for version in state.bible.list_versions().await {
                    println!("{}  {} ({})", version.id, version.name, version.abbreviation);
                }
            }
            ["/books", version_id] => {
                let books = state.bible.list_books(version_id).await;
                if books.is_empty() {
                    println!("No books found.");
                }
                for book in books {
                    println!("{}  {} ({} chapters)", book.id, book.name, book.chapter_count);
                }
            }
            ["/read", version_id, book_id, chapter] => match chapter.parse::<u32>() {
                Ok(chapter) => {
                    let verses = state.bible.get_chapter(version_id, book_id, chapter).await;
                    if verses.is_empty() {
                        println!("No verses found.");
                    }
                    for verse in verses {
                        println!("{}. {}", verse.verse_number, verse.text);
                    }
                }
                Err(_) => println!("Chapter must be a number."),
            },
            ["/search", version_id, rest @ ..] if !rest.is_empty() => {
                let query = rest.join(" ");
                for verse in state.bible.search_verses(version_id, &query, 20).await {
                    println!("{}  {}", verse.id, verse.text);
                }
            }
            ["/sessions"] => {
                for session in state.sessions.load_sessions(USER_ID).await? {
                    println!(
                        "{}  {} messages, updated {}",
                        session.id,
                        session.messages.len(),
                        session.updated_at
                    );
                }
            }
            ["/new"] => {
                session_id = state.sessions.create_session(USER_ID).await?.id;
                println!("Started session {}", session_id);
            }
            ["/clear-cache"] => {
                state.bible.clear_cache().await;
                println!("Scripture cache cleared.");
            }
            _ if line.starts_with('/') => println!("Unknown command. Try /help."),
            _ => {
                let result = state
                    .sessions
                    .send_message_streaming(session_id, line, &language, false, |delta, _| {
                        print!("{}", delta);
                        let _ = std::io::stdout().flush();
                    })
                    .await;
                println!();
                if let Err(e) = result {
                    eprintln!("Error: {}", e);
                }
            }
        }
    }

    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  /versions                      list Bible versions");
    println!("  /books <versionId>             list books of a version");
    println!("  /read <versionId> <bookId> <chapter>   read a chapter");
    println!("  /search <versionId> <query>    search verses");
    println!("  /sessions                      list chat sessions");
    println!("  /new                           start a new chat session");
    println!("  /clear-cache                   drop cached scripture data");
    println!("  /quit                          exit");
    println!("Anything else is sent to the assistant.");
}
