//! A one-shot client session against a running replica group.
//!
//! ```text
//! $ cargo run --example session -- --replica r1=127.0.0.1:4001 rate 7 42 4.5
//! $ cargo run --example session -- --replica r1=127.0.0.1:4001 get 7
//! ```
//!
//! Commands: `list`, `list-max`, `search <name>`, `movie <id>`, `get <user>`,
//! `rate <user> <movie> <value>`, `unrate <user> <movie>`, `tag <user> <movie> <tag>...`,
//! `untag <user> <movie> <tag>...`, `create <name> <genre>...`.

use reelsync::frontend::Session;
use reelsync::registry::{InMemoryRegistry, Registry, REPLICA_TAG};
use reelsync::rpc::Transport;
use reelsync::spawn::UdpTransport;
use std::collections::BTreeSet;
use std::sync::Arc;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();
    let replicas: Vec<String> = args.values_from_str("--replica")?;
    let rest: Vec<String> = args
        .finish()
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    for replica in &replicas {
        let (id, endpoint) = replica
            .split_once('=')
            .ok_or("replicas must look like id=host:port")?;
        registry.register(&format!("{}:{}", REPLICA_TAG, id), endpoint, &[REPLICA_TAG])?;
    }
    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::default());
    let mut session = Session::new(registry, transport);

    let words: Vec<&str> = rest.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["list"] => {
            for (id, name) in session.list_movies(false)? {
                println!("{:<8} {}", id, name);
            }
        }
        ["list-max"] => {
            for (id, name) in session.list_movies(true)? {
                println!("{:<8} {}", id, name);
            }
        }
        ["search", name] => {
            for (id, movie) in session.search(name, BTreeSet::new())? {
                println!("{:<8} {:<40} {:?}", id, movie.name, movie.genres);
            }
        }
        ["movie", id] => match session.get_movie(id.parse()?)? {
            Some(detail) => {
                println!("{}", detail.name);
                println!("  genres: {:?}", detail.genres);
                println!("  tags:   {:?}", detail.tags);
                println!(
                    "  ratings: {} (avg {:?}, min {:?}, max {:?})",
                    detail.ratings.len, detail.ratings.avg, detail.ratings.min, detail.ratings.max
                );
            }
            None => println!("no such movie"),
        },
        ["get", user] => {
            let data = session.get_user_data(user.parse()?)?;
            for (movie, value) in &data.ratings {
                println!("{:<8} rated {:.1}", movie, value);
            }
            for (movie, tags) in &data.tags {
                println!("{:<8} tagged {:?}", movie, tags);
            }
        }
        ["rate", user, movie, value] => {
            session.add_rating(user.parse()?, movie.parse()?, value.parse()?)?;
        }
        ["unrate", user, movie] => {
            session.delete_rating(user.parse()?, movie.parse()?)?;
        }
        ["tag", user, movie, tags @ ..] if !tags.is_empty() => {
            let tags = tags.iter().map(|tag| tag.to_string()).collect();
            session.add_tag(user.parse()?, movie.parse()?, tags)?;
        }
        ["untag", user, movie, tags @ ..] if !tags.is_empty() => {
            let tags = tags.iter().map(|tag| tag.to_string()).collect();
            session.remove_tag(user.parse()?, movie.parse()?, tags)?;
        }
        ["create", name, genres @ ..] => {
            let genres = genres.iter().map(|genre| genre.to_string()).collect();
            let id = session.add_movie(name, genres)?;
            println!("created movie {}", id);
        }
        _ => return Err("unknown command; see the module docs for usage".into()),
    }
    Ok(())
}
