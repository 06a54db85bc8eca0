use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use waypoint_balancer::HashRing;

#[derive(Debug, Parser)]
#[command(after_help = EXAMPLES_TEXT)]
pub struct Ring {
    #[arg(
        long = "endpoint",
        short = 'e',
        required = true,
        help = "Ring member as uri=points, repeat for every member"
    )]
    pub endpoints: Vec<String>,

    #[arg(
        long,
        short = 'k',
        default_value_t = 10000,
        help = "Number of synthetic keys (key-0 .. key-N) to place on the ring"
    )]
    pub keys: usize,

    #[arg(long, short = 'l', help = "Print the owner of these keys")]
    pub lookup: Vec<String>,
}

const EXAMPLES_TEXT: &str = r#"
EXAMPLES:
    # Two equal members and one with twice the points
    waypoint ring -e http://a:8080=100 -e http://b:8080=100 -e http://c:8080=200

    # Where do two specific keys land
    waypoint ring -e http://a:8080=100 -e http://b:8080=100 -l user-42 -l user-43
"#;

fn parse_endpoint(arg: &str) -> Result<(String, u32)> {
    let (uri, points) = arg
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("endpoint '{}' is not in the uri=points form", arg))?;
    let points: u32 = points
        .trim()
        .parse()
        .context(format!("invalid point count in '{}'", arg))?;
    if uri.trim().is_empty() {
        return Err(anyhow!("endpoint '{}' has an empty uri", arg));
    }
    Ok((uri.trim().to_string(), points))
}

/// Keys owned by every member, in member order.
fn distribution(ring: &HashRing<String>, keys: usize) -> BTreeMap<String, usize> {
    let mut owned: BTreeMap<String, usize> = ring
        .members()
        .iter()
        .map(|member| (member.clone(), 0))
        .collect();
    for i in 0..keys {
        let key = format!("key-{}", i);
        if let Some(owner) = ring.get(key.as_bytes()) {
            *owned.entry(owner.clone()).or_default() += 1;
        }
    }
    owned
}

pub fn handle_ring(args: Ring) -> Result<()> {
    let weighted = args
        .endpoints
        .iter()
        .map(|arg| parse_endpoint(arg))
        .collect::<Result<Vec<_>>>()?;
    let ring = HashRing::build(weighted);
    if ring.is_empty() {
        return Err(anyhow!("every endpoint has zero points, the ring is empty"));
    }

    let total_points = ring.total_points();
    println!(
        "ring: {} members, {} points, {} keys",
        ring.len(),
        total_points,
        args.keys
    );
    println!(
        "{:<40} {:>8} {:>8} {:>9} {:>9}",
        "endpoint", "points", "keys", "share", "expected"
    );
    for (member, keys) in distribution(&ring, args.keys) {
        let points = ring.points_of(&member);
        let share = if args.keys == 0 {
            0.0
        } else {
            keys as f64 * 100.0 / args.keys as f64
        };
        let expected = points as f64 * 100.0 / total_points as f64;
        println!(
            "{:<40} {:>8} {:>8} {:>8.2}% {:>8.2}%",
            member, points, keys, share, expected
        );
    }

    for key in &args.lookup {
        match ring.get(key.as_bytes()) {
            Some(owner) => println!("{} -> {}", key, owner),
            None => println!("{} -> (none)", key),
        }
    }
    Ok(())
}
