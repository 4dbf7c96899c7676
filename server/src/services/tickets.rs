use crate::error::ApiError;
use crate::store::{Store, StoreError, TicketFilter, TicketUpdate, TicketView, NO_LIMIT};
use chrono::Utc;
use odds_types::{NewTicket, Ticket, TicketGroup, WalletAddress};
use serde::Serialize;
use tracing::info;

/// A ticket as returned by the ticket routes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDetails {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub owner: WalletAddress,
    pub is_winning: bool,
}

impl From<TicketView> for TicketDetails {
    fn from(view: TicketView) -> Self {
        Self {
            is_winning: view.ticket.is_winning(),
            ticket: view.ticket,
            owner: view.owner,
        }
    }
}

fn details(views: Vec<TicketView>) -> Vec<TicketDetails> {
    views.into_iter().map(TicketDetails::from).collect()
}

#[derive(Clone)]
pub struct TicketService {
    store: Store,
}

impl TicketService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Issue the next ticket of `raffle_id` to `user_id` with a random group.
    pub async fn create(
        &self,
        user_id: i64,
        raffle_id: i64,
        referral_code_id: Option<i64>,
    ) -> Result<Ticket, ApiError> {
        let group = TicketGroup::random(&mut rand::thread_rng());
        let now = Utc::now();
        let ticket = self
            .store
            .run(move |db| {
                if db.user(user_id)?.is_none() {
                    return Err(ApiError::not_found(format!(
                        "User with ID {user_id} not found"
                    )));
                }
                let raffle = db.lock_raffle(raffle_id)?.ok_or_else(|| {
                    ApiError::not_found(format!("Raffle with ID {raffle_id} not found"))
                })?;
                if let Some(code_id) = referral_code_id {
                    if db.referral_code_by_id(code_id)?.is_none() {
                        return Err(ApiError::not_found(format!(
                            "Referral code with ID {code_id} not found"
                        )));
                    }
                }
                if raffle.is_sold_out() {
                    return Err(ApiError::bad_request(format!(
                        "Raffle {raffle_id} is sold out"
                    )));
                }

                let ticket = db.insert_ticket(
                    &NewTicket {
                        ticket_number: raffle.total_tickets + 1,
                        raffle_id,
                        owner_id: user_id,
                        referral_code_id,
                        purchase_transaction_hash: None,
                        is_auto_enrolled: false,
                        group: Some(group),
                    },
                    now,
                )?;
                db.add_raffle_tickets(raffle_id, 1, now)?;
                db.add_user_tickets(user_id, 1, now)?;
                Ok(ticket)
            })
            .await?;
        info!(
            ticket_id = ticket.id,
            raffle_id,
            user_id,
            number = ticket.ticket_number,
            "ticket issued"
        );
        Ok(ticket)
    }

    pub async fn find_all(&self) -> Result<Vec<TicketDetails>, ApiError> {
        let views = self
            .store
            .run(|db| db.tickets(TicketFilter::All, 0, NO_LIMIT))
            .await?;
        Ok(details(views))
    }

    pub async fn find_one(&self, id: i64) -> Result<TicketDetails, ApiError> {
        self.store
            .run(move |db| -> Result<_, StoreError> {
                let Some(ticket) = db.ticket(id)? else {
                    return Ok(None);
                };
                let owner = db.user(ticket.owner_id)?;
                Ok(owner.map(|owner| TicketView {
                    ticket,
                    owner: owner.wallet_address,
                }))
            })
            .await?
            .map(TicketDetails::from)
            .ok_or_else(|| ApiError::not_found(format!("Ticket with ID {id} not found")))
    }

    pub async fn find_by_user(&self, user_id: i64) -> Result<Vec<TicketDetails>, ApiError> {
        let views = self
            .store
            .run(move |db| db.tickets(TicketFilter::Owner(user_id), 0, NO_LIMIT))
            .await?;
        Ok(details(views))
    }

    pub async fn find_by_raffle(&self, raffle_id: i64) -> Result<Vec<TicketDetails>, ApiError> {
        let views = self
            .store
            .run(move |db| db.tickets(TicketFilter::Raffle(raffle_id), 0, NO_LIMIT))
            .await?;
        Ok(details(views))
    }

    pub async fn update(&self, id: i64, update: TicketUpdate) -> Result<TicketDetails, ApiError> {
        let now = Utc::now();
        let changed = self
            .store
            .run(move |db| db.update_ticket(id, &update, now))
            .await?;
        if !changed {
            return Err(ApiError::not_found(format!("Ticket with ID {id} not found")));
        }
        self.find_one(id).await
    }

    /// Delete a ticket. Raffle and user counters are left as they are.
    pub async fn remove(&self, id: i64) -> Result<(), ApiError> {
        let deleted = self.store.run(move |db| db.delete_ticket(id)).await?;
        if !deleted {
            return Err(ApiError::not_found(format!("Ticket with ID {id} not found")));
        }
        info!(ticket_id = id, "ticket removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odds_types::{RaffleStatus, RaffleTemplate, Usdc};

    async fn setup() -> (TicketService, Store, i64, i64) {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let (user, raffle) = store
            .run(move |db| {
                let user = db.insert_user(&WalletAddress::from_bytes([5; 20]), now)?;
                let template = RaffleTemplate {
                    max_tickets: 2,
                    ..RaffleTemplate::default()
                };
                let raffle = db.insert_raffle(&template.pooled(now), now)?;
                db.set_raffle_status(raffle.id, RaffleStatus::Active, None, now)?;
                Ok::<_, StoreError>((user.id, raffle.id))
            })
            .await
            .unwrap();
        (TicketService::new(store.clone()), store, user, raffle)
    }

    #[tokio::test]
    async fn create_numbers_tickets_and_bumps_counters() {
        let (service, store, user, raffle) = setup().await;
        let first = service.create(user, raffle, None).await.unwrap();
        let second = service.create(user, raffle, None).await.unwrap();
        assert_eq!((first.ticket_number, second.ticket_number), (1, 2));
        assert!(first.group.is_some());

        let err = service.create(user, raffle, None).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let (raffle, user) = store
            .run(move |db| Ok::<_, StoreError>((db.raffle(raffle)?, db.user(user)?)))
            .await
            .unwrap();
        assert_eq!(raffle.unwrap().total_tickets, 2);
        assert_eq!(user.unwrap().total_tickets_purchased, 2);
    }

    #[tokio::test]
    async fn create_reports_missing_references() {
        let (service, _, user, raffle) = setup().await;
        assert!(matches!(
            service.create(99, raffle, None).await,
            Err(ApiError::NotFound(message)) if message == "User with ID 99 not found"
        ));
        assert!(matches!(
            service.create(user, 42, None).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            service.create(user, raffle, Some(7)).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_and_remove() {
        let (service, _, user, raffle) = setup().await;
        let ticket = service.create(user, raffle, None).await.unwrap();

        let updated = service
            .update(
                ticket.id,
                TicketUpdate {
                    group: Some(TicketGroup::Group1),
                    prize_amount: Some(Usdc::from_units(2)),
                    is_distributed: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.is_winning);
        assert_eq!(updated.ticket.prize_amount, Usdc::from_units(2));
        assert_eq!(service.find_by_user(user).await.unwrap().len(), 1);
        assert_eq!(service.find_by_raffle(raffle).await.unwrap().len(), 1);
        assert_eq!(service.find_all().await.unwrap().len(), 1);

        service.remove(ticket.id).await.unwrap();
        assert!(matches!(
            service.find_one(ticket.id).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            service.remove(ticket.id).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            service.update(ticket.id, TicketUpdate::default()).await,
            Err(ApiError::NotFound(_))
        ));
    }
}
