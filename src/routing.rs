use crate::config::{ConfigSnapshot, UpstreamService, split_alias};
use crate::error::{AppError, AppResult};

/// One attempt target: a channel plus the model name to send it. The
/// upstream model differs from the requested one when the channel advertises
/// the requested name as an `alias:real` entry.
#[derive(Debug, Clone)]
pub struct ChannelRoute {
    pub service: UpstreamService,
    pub upstream_model: String,
}

/// Resolves the ordered attempt list for a requested model.
///
/// Order is priority descending; ties prefer `is_default`, then config
/// order. Placeholder channels (blank key or no models) never appear in the
/// result. When no channel advertises the model the default channel is used,
/// falling back to the highest-priority channel overall.
pub fn resolve_channels(
    snapshot: &ConfigSnapshot,
    requested_model: &str,
) -> AppResult<Vec<ChannelRoute>> {
    let services = snapshot.services();

    let mut candidates: Vec<(usize, ChannelRoute)> = Vec::new();

    if snapshot.features().model_passthrough {
        for (idx, service) in services.iter().enumerate() {
            if service.is_placeholder() {
                tracing::warn!(channel = %service.name, "skipping placeholder channel");
                continue;
            }
            candidates.push((
                idx,
                ChannelRoute {
                    service: service.clone(),
                    upstream_model: requested_model.to_string(),
                },
            ));
        }
    } else {
        for (idx, service) in services.iter().enumerate() {
            if service.is_placeholder() {
                continue;
            }
            if let Some(upstream_model) = advertised_as(service, requested_model) {
                candidates.push((
                    idx,
                    ChannelRoute {
                        service: service.clone(),
                        upstream_model,
                    },
                ));
            }
        }

        if candidates.is_empty() {
            // Nothing advertises the model: route to the default channel,
            // or failing that the highest-priority channel overall.
            let fallback = services
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.is_placeholder() && s.is_default)
                .max_by_key(|(idx, s)| (s.priority, std::cmp::Reverse(*idx)))
                .or_else(|| {
                    services
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| !s.is_placeholder())
                        .max_by_key(|(idx, s)| (s.priority, std::cmp::Reverse(*idx)))
                });
            if let Some((idx, service)) = fallback {
                tracing::warn!(
                    model = %requested_model,
                    channel = %service.name,
                    "requested model not advertised by any channel, using fallback"
                );
                candidates.push((
                    idx,
                    ChannelRoute {
                        service: service.clone(),
                        upstream_model: requested_model.to_string(),
                    },
                ));
            }
        }
    }

    if candidates.is_empty() {
        return Err(AppError::no_upstream(requested_model));
    }

    candidates.sort_by(|(a_idx, a), (b_idx, b)| {
        b.service
            .priority
            .cmp(&a.service.priority)
            .then_with(|| b.service.is_default.cmp(&a.service.is_default))
            .then_with(|| a_idx.cmp(b_idx))
    });

    Ok(candidates.into_iter().map(|(_, route)| route).collect())
}

/// Returns the model name to send upstream when `service` advertises
/// `requested`, either as a plain entry or as the alias side of a
/// `alias:real` entry.
fn advertised_as(service: &UpstreamService, requested: &str) -> Option<String> {
    for entry in &service.models {
        match split_alias(entry) {
            Some((alias, real)) => {
                if alias == requested {
                    return Some(real.to_string());
                }
            }
            None => {
                if entry == requested {
                    return Some(requested.to_string());
                }
            }
        }
    }
    None
}
