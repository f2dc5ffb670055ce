/// Tallyx API Demo
///
/// Demonstrates the main engine operations:
/// - Declaring a record type
/// - Ingesting through the front door
/// - Filtering and aggregating a shard
/// - Time-range shard selection
/// - Reopening a store

use std::collections::BTreeMap;
use std::time::Duration;
use tallyx::query::aggregate::{self, BOUNCE, DOMAIN, SESSION, TIMESTAMP, UID};
use tallyx::{Config, Db, Filter, Index, Ingest, Predicate, Store};

tallyx::record! {
    pub struct PageView {
        pub uid: u64,
        pub ts: u64,
        pub new_session: bool,
        pub bounced: Option<bool>,
        pub props: Option<BTreeMap<String, String>>,
    }
}

struct Visit {
    view: PageView,
    domain: &'static str,
    path: &'static str,
}

impl Ingest for PageView {
    fn timestamp(&self) -> u64 {
        self.ts
    }

    fn index(&self, index: &mut Index<'_>) {
        index.int64(UID, self.uid as i64);
        index.int64(TIMESTAMP, self.ts as i64);
        index.int64(SESSION, self.new_session as i64);
        let bounce = match self.bounced {
            Some(true) => 1,
            Some(false) => -1,
            None => 0,
        };
        index.int64(BOUNCE, bounce);
        if let Some(props) = &self.props {
            if let Some(domain) = props.get(DOMAIN) {
                index.string(DOMAIN, domain);
            }
            if let Some(path) = props.get("path") {
                index.string("path", path);
            }
        }
    }
}

fn visit(uid: u64, ts: u64, new_session: bool, bounced: Option<bool>, domain: &'static str, path: &'static str) -> Visit {
    Visit {
        view: PageView { uid, ts, new_session, bounced, props: None },
        domain,
        path,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║          Tallyx Engine - API Demo             ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    let dir = std::env::temp_dir().join("tallyx-demo");
    let _ = std::fs::remove_dir_all(&dir);

    // Step 1: Open store and start ingestion
    println!("Step 1: Opening store at {}", dir.display());
    let config = Config::new(&dir)
        .with_shard_width(4)
        .with_flush_interval(Duration::from_secs(1));
    let store = Store::open(config.clone())?;
    let db = Db::<PageView>::start(&store, &config)?;
    println!("  Done!\n");

    // Step 2: Ingest page views
    println!("Step 2: Ingesting page views...");
    let visits = [
        visit(1, 1_000, true, Some(false), "example.com", "/"),
        visit(1, 1_060, false, Some(false), "example.com", "/blog"),
        visit(2, 1_100, true, Some(true), "example.com", "/about"),
        visit(3, 1_150, true, Some(true), "other.org", "/"),
        visit(2, 2_000, true, Some(false), "example.com", "/blog/a"),
        visit(4, 2_050, true, None, "example.com", "/pricing"),
    ];
    for Visit { mut view, domain, path } in visits {
        view.props = Some(BTreeMap::from([
            (DOMAIN.to_string(), domain.to_string()),
            ("path".to_string(), path.to_string()),
        ]));
        db.append(view)?;
    }
    let stats = db.stats();
    db.close()?;
    println!("  Accepted {} page views, store now at seq {}\n", stats.accepted, store.next_seq());

    // Step 3: Filter and aggregate shard 0
    println!("Step 3: Aggregating shard 0...");
    let view = store.view(0);
    let found = view.existence(UID)?;
    let example = Predicate::equal(DOMAIN, "example.com").apply(&view, &found)?;
    println!("  visitors on example.com: {}", aggregate::visitors(&view, &example)?);
    println!("  visits on example.com:   {}", aggregate::visits(&view, &example)?);
    println!("  net bounces:             {}", aggregate::bounce(&view, &example)?);

    let blog = Predicate::regex("path", "^/blog")?.apply(&view, &found)?;
    println!("  /blog* page views:       {}", blog.len());
    for (path, count) in aggregate::breakdown(&view, "path", &found)? {
        println!("    {:<10} {}", path, count);
    }
    println!();

    // Step 4: Time-range selection
    println!("Step 4: Time-range shard selection...");
    println!("  shards in [900, 1200]:  {:?}", store.shards_in_range(900, 1_200)?);
    println!("  shards in [1900, 2100]: {:?}", store.shards_in_range(1_900, 2_100)?);
    println!(
        "  current visitors on example.com at t=2100 (last 200): {}",
        aggregate::current_visitor_at(&store, "example.com", 2_100, 200)?
    );
    println!();

    // Step 5: Reopen
    println!("Step 5: Closing and reopening...");
    drop(view);
    store.close()?;
    let store = Store::open(config)?;
    let stats = store.stats()?;
    println!("  shards: {}, next seq: {}, kv version: {}", stats.shards, stats.next_seq, stats.kv.version);

    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║              Demo Complete!                   ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    Ok(())
}
