/// Source of the signed-in account. Absence means every remote operation
/// becomes a silent no-op.
pub trait AccountProvider: Send + Sync {
    fn current_account_id(&self) -> Option<String>;
}

/// Account resolved once from flags, environment or config.
#[derive(Debug, Clone, Default)]
pub struct StaticAccount {
    account_id: Option<String>,
}

impl StaticAccount {
    pub fn new(account_id: Option<String>) -> Self {
        Self {
            account_id: account_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        }
    }
}

impl AccountProvider for StaticAccount {
    fn current_account_id(&self) -> Option<String> {
        self.account_id.clone()
    }
}
