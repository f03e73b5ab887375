use log::warn;
use std::collections::HashSet;

use super::models::Ticket;
use super::repository::TicketRepository;
use crate::core::error::CoreResult;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeResolution {
    /// The last ticket of the chain (`merged_into_ticket_id` is null).
    Resolved(Ticket),
    /// A ticket was revisited or the chain exceeded the allowed depth.
    CycleDetected,
    NotFound,
}

impl MergeResolution {
    pub fn into_ticket(self) -> Option<Ticket> {
        match self {
            Self::Resolved(ticket) => Some(ticket),
            _ => None,
        }
    }
}

/// Follows `merged_into_ticket_id` from `ticket_id` for at most `max_depth` hops.
pub async fn resolve_merge_chain(
    repo: &dyn TicketRepository,
    ticket_id: i64,
    max_depth: usize,
) -> CoreResult<MergeResolution> {
    let mut visited = HashSet::new();
    let mut current = ticket_id;

    loop {
        if !visited.insert(current) || visited.len() > max_depth + 1 {
            warn!("Merge chain starting at ticket {ticket_id} loops or is too deep");
            return Ok(MergeResolution::CycleDetected);
        }
        let Some(ticket) = repo.get_ticket(current).await? else {
            return Ok(MergeResolution::NotFound);
        };
        match ticket.merged_into_ticket_id {
            Some(next) => current = next,
            None => return Ok(MergeResolution::Resolved(ticket)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::models::NewTicket;
    use crate::tickets::repository::MemoryTicketRepository;

    async fn chain(repo: &MemoryTicketRepository, n: usize) -> Vec<Ticket> {
        let mut out = Vec::new();
        for i in 0..n {
            out.push(
                repo.create_ticket(NewTicket::new(format!("T{i}"), "open"))
                    .await
                    .unwrap(),
            );
        }
        for pair in out.windows(2) {
            let mut t = pair[0].clone();
            t.merged_into_ticket_id = Some(pair[1].id);
            repo.put_ticket(t).unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_unmerged_ticket_resolves_to_itself() {
        let repo = MemoryTicketRepository::new();
        let tickets = chain(&repo, 1).await;
        let resolved = resolve_merge_chain(&repo, tickets[0].id, 10).await.unwrap();
        assert_eq!(resolved.into_ticket().unwrap().id, tickets[0].id);
    }

    #[tokio::test]
    async fn test_follows_chain_to_the_end() {
        let repo = MemoryTicketRepository::new();
        let tickets = chain(&repo, 4).await;
        let resolved = resolve_merge_chain(&repo, tickets[0].id, 10).await.unwrap();
        assert_eq!(resolved.into_ticket().unwrap().id, tickets[3].id);
    }

    #[tokio::test]
    async fn test_cycle_is_detected() {
        let repo = MemoryTicketRepository::new();
        let tickets = chain(&repo, 3).await;
        let mut last = tickets[2].clone();
        last.merged_into_ticket_id = Some(tickets[0].id);
        repo.put_ticket(last).unwrap();
        assert_eq!(
            resolve_merge_chain(&repo, tickets[0].id, 10).await.unwrap(),
            MergeResolution::CycleDetected
        );
    }

    #[tokio::test]
    async fn test_depth_limit_and_missing_ticket() {
        let repo = MemoryTicketRepository::new();
        let tickets = chain(&repo, 5).await;
        assert_eq!(
            resolve_merge_chain(&repo, tickets[0].id, 2).await.unwrap(),
            MergeResolution::CycleDetected
        );
        assert_eq!(
            resolve_merge_chain(&repo, 999, 10).await.unwrap(),
            MergeResolution::NotFound
        );
    }
}
