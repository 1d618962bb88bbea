use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::crm::{conversation_summary, render_deal_note, CrmClient, LeadIdentity, LeadSubmission};
use crate::error::{CrmError, FinalizeError, RegistryError, StoreError};
use crate::icp::{self, IcpVerdict};
use crate::prompting::AGENT_NAME;
use crate::registry::CompanyRegistry;
use crate::store::{SessionStore, DEFAULT_HISTORY_LIMIT};
use crate::types::{Contact, ContactPatch, Stage};
use crate::validation::{digits_only, format_phone};

const NOT_FOUND_REASON: &str = "CNPJ não encontrado na Receita Federal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The contact was already completed; nothing was submitted.
    AlreadyCompleted,
    Submitted {
        deal_id: Option<String>,
        qualified: bool,
    },
}

/// Hand-off from the conversation to enrichment and CRM submission.
#[async_trait]
pub trait LeadHandoff: Send + Sync {
    async fn finalize(&self, contact_id: &str) -> Result<FinalizeOutcome, FinalizeError>;
}

pub struct LeadFinalizer {
    store: Arc<dyn SessionStore>,
    registry: Arc<dyn CompanyRegistry>,
    crm: Arc<dyn CrmClient>,
    clock: Arc<dyn Clock>,
}

impl LeadFinalizer {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<dyn CompanyRegistry>,
        crm: Arc<dyn CrmClient>,
    ) -> Self {
        Self {
            store,
            registry,
            crm,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lead_identity(contact: &Contact, tax_id: &str) -> LeadIdentity {
        let memory = contact.merged_memory();
        let text = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        LeadIdentity {
            contact_id: contact.id.clone(),
            name: text(memory.name).unwrap_or_default(),
            phone: format_phone(&digits_only(&contact.phone())),
            email: text(memory.email).unwrap_or_default(),
            tax_id: tax_id.to_string(),
            origin: text(memory.origin).unwrap_or_default(),
            source: text(memory.source),
            campaign: text(memory.campaign),
            product: text(memory.product),
            quantity: text(memory.quantity),
            deadline: text(memory.deadline),
        }
    }
}

#[async_trait]
impl LeadHandoff for LeadFinalizer {
    async fn finalize(&self, contact_id: &str) -> Result<FinalizeOutcome, FinalizeError> {
        let Some(contact) = self.store.get_contact(contact_id).await? else {
            return Err(StoreError::ContactNotFound(contact_id.to_string()).into());
        };
        if contact.stage == Stage::Completed {
            info!(contact_id = %contact_id, "lead already finalized, skipping");
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        let tax_id = contact
            .tax_id
            .clone()
            .or_else(|| contact.data_cache.tax_id.clone())
            .map(|raw| digits_only(&raw))
            .filter(|digits| !digits.is_empty())
            .ok_or_else(|| FinalizeError::MissingTaxId(contact_id.to_string()))?;

        let (company, verdict) = match self.registry.lookup(&tax_id).await {
            Ok(record) => {
                let verdict = icp::evaluate(&record);
                (Some(record), verdict)
            }
            Err(RegistryError::NotFound(_)) => (
                None,
                IcpVerdict {
                    qualified: false,
                    reason: NOT_FOUND_REASON.to_string(),
                    matched_code: None,
                    matched_by: None,
                },
            ),
            Err(err) => return Err(err.into()),
        };
        info!(
            contact_id = %contact_id,
            tax_id = %tax_id,
            qualified = verdict.qualified,
            reason = %verdict.reason,
            "lead qualification evaluated"
        );

        let history = match contact.session_id.as_deref() {
            Some(session_id) => {
                self.store
                    .get_history(contact_id, session_id, DEFAULT_HISTORY_LIMIT)
                    .await?
            }
            None => Vec::new(),
        };
        let summary = conversation_summary(&history, AGENT_NAME);
        let now = self.clock.now();
        let lead = Self::lead_identity(&contact, &tax_id);
        let note = render_deal_note(&lead, company.as_ref(), &verdict, &summary, now);
        let submission = LeadSubmission {
            lead,
            company,
            verdict,
            conversation_summary: summary,
            note,
        };

        let deal_id = match self.crm.submit_lead(&submission).await {
            Ok(receipt) => {
                info!(
                    contact_id = %contact_id,
                    deal_id = %receipt.deal_id,
                    created = receipt.created,
                    "lead submitted to crm"
                );
                Some(receipt.deal_id)
            }
            Err(CrmError::AlreadyExists(detail)) => {
                warn!(contact_id = %contact_id, detail = %detail, "crm already has this lead, no reference returned");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let verdict = submission.verdict;
        if !verdict.qualified {
            if let Some(deal_id) = deal_id.as_deref() {
                if let Err(err) = self.crm.mark_lost(deal_id, &verdict.reason).await {
                    warn!(deal_id = %deal_id, error = %err, "failed to mark crm deal as lost");
                }
            }
        }

        self.store
            .update_contact(
                contact_id,
                ContactPatch {
                    stage: Some(Stage::Completed),
                    company: submission.company.as_ref().map(|c| c.snapshot()),
                    icp_qualified: Some(verdict.qualified),
                    disqualification_reason: Some(if verdict.qualified {
                        None
                    } else {
                        Some(verdict.reason.clone())
                    }),
                    crm_deal_id: deal_id.clone(),
                    crm_synced_at: deal_id.as_ref().map(|_| now),
                    ..Default::default()
                },
            )
            .await?;

        Ok(FinalizeOutcome::Submitted {
            deal_id,
            qualified: verdict.qualified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::CrmReceipt;
    use crate::store::MemoryStore;
    use crate::types::{ActivityCode, Address, CompanyRecord, LeadFields};
    use std::sync::Mutex;

    struct FakeRegistry {
        primary: &'static str,
        missing: bool,
    }

    #[async_trait]
    impl CompanyRegistry for FakeRegistry {
        async fn lookup(&self, tax_id: &str) -> Result<CompanyRecord, RegistryError> {
            if self.missing {
                return Err(RegistryError::NotFound(tax_id.to_string()));
            }
            Ok(CompanyRecord {
                tax_id: tax_id.to_string(),
                formatted_tax_id: "08.054.886/0001-68".into(),
                legal_name: "CASA DAS SERRAS LTDA".into(),
                trade_name: "Casa das Serras".into(),
                registration_status: "ATIVA".into(),
                opened_on: "2006-04-12".into(),
                primary_activity: ActivityCode {
                    code: self.primary.into(),
                    description: "atividade".into(),
                },
                secondary_activities: vec![],
                address: Address {
                    city: "SAO PAULO".into(),
                    state: "SP".into(),
                    ..Default::default()
                },
                phone: String::new(),
                email: String::new(),
                share_capital: None,
                company_size: Some("ME".into()),
                legal_nature: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingCrm {
        submissions: Mutex<Vec<LeadSubmission>>,
        lost: Mutex<Vec<(String, String)>>,
        already_exists: bool,
    }

    #[async_trait]
    impl CrmClient for RecordingCrm {
        fn is_configured(&self) -> bool {
            true
        }

        async fn submit_lead(&self, submission: &LeadSubmission) -> Result<CrmReceipt, CrmError> {
            self.submissions.lock().unwrap().push(submission.clone());
            if self.already_exists {
                return Err(CrmError::AlreadyExists(submission.lead.tax_id.clone()));
            }
            Ok(CrmReceipt {
                deal_id: "deal-1".into(),
                created: true,
            })
        }

        async fn mark_lost(&self, deal_id: &str, reason: &str) -> Result<(), CrmError> {
            self.lost
                .lock()
                .unwrap()
                .push((deal_id.to_string(), reason.to_string()));
            Ok(())
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_contact("5511987654321", LeadFields::default())
            .await
            .unwrap();
        store
            .update_contact(
                "5511987654321",
                ContactPatch {
                    tax_id: Some(Some("08054886000168".into())),
                    name: Some(Some("Ana".into())),
                    stage: Some(Stage::Collecting),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn qualified_lead_is_submitted_once() {
        let store = seeded_store().await;
        let crm = Arc::new(RecordingCrm::default());
        let finalizer = LeadFinalizer::new(
            store.clone(),
            Arc::new(FakeRegistry {
                primary: "4744001",
                missing: false,
            }),
            crm.clone(),
        );

        let first = finalizer.finalize("5511987654321").await.unwrap();
        assert_eq!(
            first,
            FinalizeOutcome::Submitted {
                deal_id: Some("deal-1".into()),
                qualified: true
            }
        );
        let second = finalizer.finalize("5511987654321").await.unwrap();
        assert_eq!(second, FinalizeOutcome::AlreadyCompleted);
        assert_eq!(crm.submissions.lock().unwrap().len(), 1);
        assert!(crm.lost.lock().unwrap().is_empty());

        let contact = store.get_contact("5511987654321").await.unwrap().unwrap();
        assert_eq!(contact.stage, Stage::Completed);
        assert_eq!(contact.icp_qualified, Some(true));
        assert_eq!(contact.crm_deal_id.as_deref(), Some("deal-1"));
        assert_eq!(contact.legal_name.as_deref(), Some("CASA DAS SERRAS LTDA"));
    }

    #[tokio::test]
    async fn disqualified_lead_is_submitted_then_marked_lost() {
        let store = seeded_store().await;
        let crm = Arc::new(RecordingCrm::default());
        let finalizer = LeadFinalizer::new(
            store.clone(),
            Arc::new(FakeRegistry {
                primary: "5611201",
                missing: false,
            }),
            crm.clone(),
        );

        finalizer.finalize("5511987654321").await.unwrap();
        assert_eq!(crm.submissions.lock().unwrap().len(), 1);
        let lost = crm.lost.lock().unwrap().clone();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, "deal-1");

        let contact = store.get_contact("5511987654321").await.unwrap().unwrap();
        assert_eq!(contact.stage, Stage::Completed);
        assert_eq!(contact.icp_qualified, Some(false));
        assert!(contact.disqualification_reason.is_some());
    }

    #[tokio::test]
    async fn unknown_company_is_recorded_as_disqualified() {
        let store = seeded_store().await;
        let crm = Arc::new(RecordingCrm::default());
        let finalizer = LeadFinalizer::new(
            store.clone(),
            Arc::new(FakeRegistry {
                primary: "",
                missing: true,
            }),
            crm.clone(),
        );

        finalizer.finalize("5511987654321").await.unwrap();
        let submissions = crm.submissions.lock().unwrap().clone();
        assert!(submissions[0].company.is_none());
        assert!(!submissions[0].verdict.qualified);
        let contact = store.get_contact("5511987654321").await.unwrap().unwrap();
        assert_eq!(
            contact.disqualification_reason.as_deref(),
            Some(NOT_FOUND_REASON)
        );
    }

    #[tokio::test]
    async fn existing_crm_entry_still_completes_the_contact() {
        let store = seeded_store().await;
        let crm = Arc::new(RecordingCrm {
            already_exists: true,
            ..Default::default()
        });
        let finalizer = LeadFinalizer::new(
            store.clone(),
            Arc::new(FakeRegistry {
                primary: "4744001",
                missing: false,
            }),
            crm,
        );

        let outcome = finalizer.finalize("5511987654321").await.unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::Submitted {
                deal_id: None,
                qualified: true
            }
        );
        let contact = store.get_contact("5511987654321").await.unwrap().unwrap();
        assert_eq!(contact.stage, Stage::Completed);
        assert!(contact.crm_deal_id.is_none());
    }

    #[tokio::test]
    async fn contact_without_tax_id_cannot_be_finalized() {
        let store = Arc::new(MemoryStore::new());
        store.create_contact("c1", LeadFields::default()).await.unwrap();
        let finalizer = LeadFinalizer::new(
            store,
            Arc::new(FakeRegistry {
                primary: "4744001",
                missing: false,
            }),
            Arc::new(RecordingCrm::default()),
        );
        let err = finalizer.finalize("c1").await.unwrap_err();
        assert!(matches!(err, FinalizeError::MissingTaxId(_)));
    }
}
