use std::collections::HashSet;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::bridge::{exchange, SelfInfo};
use crate::config::Config;
use crate::dialer::{get_dialer, Dialer};
use crate::{archive, is_cancelled, AnyError};

/// Merge strategy lists from two parties into a common one, following
/// the precedence set by the first party.
pub fn consensus(pa: &[String], pb: &[String]) -> Vec<String> {
    let pb_set: HashSet<&str> = pb.iter().map(String::as_str).collect();
    pa.iter()
        .filter(|name| pb_set.contains(name.as_str()))
        .cloned()
        .collect()
}

/// Run a whole transfer: negotiate a dialer with the peer, establish the
/// stream with the first dialer that delivers, and move the files.
///
/// The party with file arguments is the sender; its dialer preference
/// wins ties, because both parties order the agreed list with the
/// sender's list first.
pub async fn transfer(
    conf: &Config,
    filenames: &[String],
    destination: &str,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let is_sender = !filenames.is_empty();

    // keep only the dialers that can work here, in preference order
    let mut available: Vec<Box<dyn Dialer>> = Vec::new();
    for name in conf.strategy() {
        let Some(mut dialer) = get_dialer(&name) else {
            debug!("unknown dialer {name} in strategy");
            continue;
        };
        match dialer.init(conf).await {
            Ok(()) => available.push(dialer),
            Err(e) => debug!("dialer {name} filtered out: {e}"),
        }
    }
    if available.is_empty() {
        return Err("none of the dialers from the strategy is available".into());
    }
    let my_names: Vec<String> = available.iter().map(|d| d.name().to_string()).collect();

    // one exchange both negotiates the strategy and doubles as the first
    // punching plan
    let mut sinfo = SelfInfo {
        chan_name: conf.id.clone(),
        strategy: Some(my_names.clone()),
        ..Default::default()
    };
    for dialer in &available {
        dialer.set_info(&mut sinfo);
    }
    let pinfo = exchange(
        &format!("{}/v2/exchange", conf.server()),
        sinfo,
        conf.ports()[0],
        conf.use_ipv6(),
        cancel,
    )
    .await?;

    let peer_names = pinfo.strategy.clone().unwrap_or_default();
    let agreed = if is_sender {
        consensus(&my_names, &peer_names)
    } else {
        consensus(&peer_names, &my_names)
    };
    debug!("strategy: mine={my_names:?}, peer={peer_names:?}, agreed={agreed:?}");
    if agreed.is_empty() {
        return Err("none of the dialers from the strategy is available".into());
    }

    let mut errs: Vec<AnyError> = Vec::new();
    if is_sender {
        for name in &agreed {
            let Some(dialer) = available.iter().find(|d| d.name() == name.as_str()) else {
                continue;
            };
            match dialer.into_sender(&pinfo, cancel).await {
                Ok(sink) => {
                    debug!("sending via {name}...");
                    return archive::send_files(filenames, sink, cancel).await;
                }
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    debug!("attempt with {name} failed: {e}");
                    errs.push(e);
                }
            }
        }
    } else {
        for name in &agreed {
            let Some(dialer) = available.iter().find(|d| d.name() == name.as_str()) else {
                continue;
            };
            match dialer.into_receiver(&pinfo, cancel).await {
                Ok(source) => {
                    debug!("receiving via {name}...");
                    return archive::receive_files(source, destination, cancel).await;
                }
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    debug!("attempt with {name} failed: {e}");
                    errs.push(e);
                }
            }
        }
    }
    Err(aggregate("all attempts failed", errs))
}

fn aggregate(msg: &str, errs: Vec<AnyError>) -> AnyError {
    let joined: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("{msg}: {}", joined.join("; ")).into()
}
