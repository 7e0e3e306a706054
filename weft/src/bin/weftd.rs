//! `weftd`: a Weft mesh node.
//!
//! Listens on TCP, links to any number of peers, and optionally
//! subscribes or publishes from the command line:
//!
//! ```text
//! weftd --listen 7000 --subscribe 'sensor/+/temp'
//! weftd --listen 7001 --link 127.0.0.1:7000 --publish sensor/kitchen/temp=21.5
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 transport failure at
//! startup.

use bytes::Bytes;
use clap::Parser;
use std::process::exit;
use std::time::Duration;
use weft::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "weftd", about = "Distributed publish/subscribe mesh node")]
struct Args {
    /// TCP port to listen on (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    listen: u16,

    /// Peer to link to (host:port); repeatable
    #[arg(long)]
    link: Vec<String>,

    /// Topic separator characters
    #[arg(long, default_value = "/")]
    separator: String,

    /// Maximum rate of subscription updates per peer, in milliseconds
    #[arg(long, default_value_t = 1000)]
    subs_rate: u64,

    /// Subscribe to a topic and print matching publications; repeatable
    #[arg(long)]
    subscribe: Vec<String>,

    /// Publish `topic=payload` once after linking; repeatable
    #[arg(long)]
    publish: Vec<String>,

    /// Keep running until interrupted (default exits after publishes)
    #[arg(long)]
    stay: bool,
}

#[compio::main]
async fn main() {
    weft::dev_tracing::init();
    let args = Args::parse();

    let publishes: Vec<(String, String)> = match args
        .publish
        .iter()
        .map(|spec| {
            spec.split_once('=')
                .map(|(t, p)| (t.to_owned(), p.to_owned()))
        })
        .collect::<Option<Vec<_>>>()
    {
        Some(p) => p,
        None => {
            eprintln!("--publish wants topic=payload");
            exit(1);
        }
    };

    let cfg = NodeConfig::default()
        .with_separators(&args.separator)
        .with_subs_rate(Duration::from_millis(args.subs_rate));

    let (events_tx, events_rx) = flume::unbounded();
    let transport = match weft::transport::tcp::TcpTransport::start(args.listen, events_tx).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to start transport on port {}: {}", args.listen, e);
            exit(2);
        }
    };

    let node = match Node::new(cfg, Box::new(transport)) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            exit(1);
        }
    };
    let (runner, handle) = NodeRunner::new(node, events_rx);
    let runner_task = compio::runtime::spawn(runner.run());

    if let Ok(addr) = handle.local_addr().await {
        println!("listening on {addr}");
    }

    for peer in &args.link {
        let addr = match NodeAddr::parse(peer) {
            Ok(a) => a,
            Err(_) => {
                eprintln!("bad peer address: {peer}");
                exit(1);
            }
        };
        if let Err(e) = handle.link(addr.clone()).await {
            eprintln!("link {addr} failed: {e}");
            exit(2);
        }
        println!("linked {addr}");
    }

    for topic in &args.subscribe {
        let result = handle
            .subscribe(
                vec![topic.clone()],
                Box::new(|view: &PublicationView, payload: &[u8]| {
                    println!(
                        "{} #{} -> {}",
                        view.topics.join(" "),
                        view.seq_num,
                        String::from_utf8_lossy(payload)
                    );
                }),
            )
            .await;
        if let Err(e) = result {
            eprintln!("subscribe {topic} failed: {e}");
            exit(1);
        }
        println!("subscribed {topic}");
    }

    if !publishes.is_empty() {
        // Give linked peers a subscription-exchange round before sending
        compio::time::sleep(Duration::from_millis(args.subs_rate + 200)).await;
        for (topic, payload) in publishes {
            let publication = match handle.create_publication().await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("create publication failed: {e}");
                    exit(1);
                }
            };
            let init = handle
                .init_publication(publication, vec![topic.clone()], false, vec![], None)
                .await;
            if let Err(e) = init {
                eprintln!("bad topic {topic}: {e}");
                exit(1);
            }
            match handle
                .publish(publication, Bytes::from(payload.into_bytes()), 0)
                .await
            {
                Ok(sn) => println!("published {topic} #{sn}"),
                Err(e) => eprintln!("publish {topic} failed: {e}"),
            }
        }
    }

    if args.stay || !args.subscribe.is_empty() {
        // Run until interrupted
        runner_task.await;
    } else {
        let _ = handle.destroy().await;
    }
}
