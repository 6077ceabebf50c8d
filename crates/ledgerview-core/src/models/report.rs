use std::{collections::BTreeSet, fmt::Display, ops::AddAssign, sync::Arc};

use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use super::{CoaType, NormalBalance};
use crate::money::{to_display_string, NumberLocale};

/// Which balance rows a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalanceScope {
    Day { date: Date },
    Range { from: Date, to: Date },
}

impl BalanceScope {
    pub fn first_date(&self) -> Date {
        match self {
            BalanceScope::Day { date } => *date,
            BalanceScope::Range { from, .. } => *from,
        }
    }

    pub fn last_date(&self) -> Date {
        match self {
            BalanceScope::Day { date } => *date,
            BalanceScope::Range { to, .. } => *to,
        }
    }
}

impl Display for BalanceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceScope::Day { date } => write!(f, "{}", date),
            BalanceScope::Range { from, to } => write!(f, "{}..{}", from, to),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub opening: Decimal,
    pub debit: Decimal,
    pub credit: Decimal,
    pub closing: Decimal,
}

impl AddAssign<&Totals> for Totals {
    fn add_assign(&mut self, rhs: &Totals) {
        self.opening += rhs.opening;
        self.debit += rhs.debit;
        self.credit += rhs.credit;
        self.closing += rhs.closing;
    }
}

impl Totals {
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Totals>) -> Totals {
        let mut total = Totals::default();
        for item in items {
            total += item;
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLeaf {
    pub account_number: Arc<str>,
    pub sub_category_code: Arc<str>,
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCategoryNode {
    pub code: Arc<str>,
    pub name: Arc<str>,
    pub totals: Totals,
    pub accounts: Vec<AccountLeaf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub code: Arc<str>,
    pub name: Arc<str>,
    pub totals: Totals,
    pub sub_categories: Vec<SubCategoryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoaTypeNode {
    pub coa_type: CoaType,
    pub totals: Totals,
    pub categories: Vec<CategoryNode>,
}

/// Accounts whose sub-category has no known category mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnmappedBucket {
    pub totals: Totals,
    pub accounts: Vec<AccountLeaf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceTree {
    pub entity_code: Arc<str>,
    pub scope: BalanceScope,
    pub excluded_sub_categories: Vec<String>,
    pub coa_types: Vec<CoaTypeNode>,
    pub unmapped: UnmappedBucket,
    pub grand_total: Totals,
    pub generated_at: OffsetDateTime,
}

impl TrialBalanceTree {
    pub fn coa_total(&self, coa_type: CoaType) -> Totals {
        self.coa_types
            .iter()
            .find(|n| n.coa_type == coa_type)
            .map(|n| n.totals)
            .unwrap_or_default()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &AccountLeaf> {
        self.coa_types
            .iter()
            .flat_map(|t| t.categories.iter())
            .flat_map(|c| c.sub_categories.iter())
            .flat_map(|s| s.accounts.iter())
            .chain(self.unmapped.accounts.iter())
    }

    /// Sets every parent total, the unmapped total and the grand total from the leaves.
    pub fn recompute_totals(&mut self) {
        for coa in &mut self.coa_types {
            for category in &mut coa.categories {
                for sub in &mut category.sub_categories {
                    sub.totals = Totals::sum(sub.accounts.iter().map(|a| &a.totals));
                }
                category.totals = Totals::sum(category.sub_categories.iter().map(|s| &s.totals));
            }
            coa.totals = Totals::sum(coa.categories.iter().map(|c| &c.totals));
        }
        self.unmapped.totals = Totals::sum(self.unmapped.accounts.iter().map(|a| &a.totals));
        self.grand_total = Totals::sum(self.coa_types.iter().map(|n| &n.totals));
        self.grand_total += &self.unmapped.totals;
    }

    /// Drops the given sub-categories, prunes nodes left empty and recomputes totals.
    pub fn without_sub_categories(&self, excluded: &BTreeSet<String>) -> TrialBalanceTree {
        let mut tree = self.clone();
        for coa in &mut tree.coa_types {
            for category in &mut coa.categories {
                category.sub_categories.retain(|s| !excluded.contains(s.code.as_ref()));
            }
            coa.categories.retain(|c| !c.sub_categories.is_empty());
        }
        tree.coa_types.retain(|n| !n.categories.is_empty());
        tree.unmapped
            .accounts
            .retain(|a| !excluded.contains(a.sub_category_code.as_ref()));

        let mut all: BTreeSet<String> = self.excluded_sub_categories.iter().cloned().collect();
        all.extend(excluded.iter().cloned());
        tree.excluded_sub_categories = all.into_iter().collect();
        tree.recompute_totals();
        tree
    }

    /// Checks that every parent equals the sum of its children and that the
    /// grand total and the balance sheet reconcile with the leaves.
    pub fn verify(&self) -> Result<(), String> {
        for coa in &self.coa_types {
            for category in &coa.categories {
                for sub in &category.sub_categories {
                    let sum = Totals::sum(sub.accounts.iter().map(|a| &a.totals));
                    if sum != sub.totals {
                        return Err(format!("sub-category {} does not match its accounts", sub.code));
                    }
                }
                let sum = Totals::sum(category.sub_categories.iter().map(|s| &s.totals));
                if sum != category.totals {
                    return Err(format!("category {} does not match its sub-categories", category.code));
                }
            }
            let sum = Totals::sum(coa.categories.iter().map(|c| &c.totals));
            if sum != coa.totals {
                return Err(format!("{} does not match its categories", coa.coa_type));
            }
        }

        let unmapped = Totals::sum(self.unmapped.accounts.iter().map(|a| &a.totals));
        if unmapped != self.unmapped.totals {
            return Err("unmapped bucket does not match its accounts".to_string());
        }

        let mut by_type = Totals::sum(self.coa_types.iter().map(|n| &n.totals));
        by_type += &self.unmapped.totals;
        if by_type != self.grand_total {
            return Err("COA type totals plus unmapped do not match the grand total".to_string());
        }

        let leaves = Totals::sum(self.leaves().map(|l| &l.totals));
        if leaves != self.grand_total {
            return Err("leaf totals do not match the grand total".to_string());
        }

        let sheet = self.balance_sheet();
        if sheet.total_assets + sheet.total_liabilities + sheet.unmapped_total != leaves.closing {
            return Err("balance sheet totals do not match the leaf closings".to_string());
        }

        Ok(())
    }

    /// Balance-sheet view of the tree. Every COA type lands on the side of
    /// its normal balance, so income and expense of the open period are
    /// carried until they are closed into equity.
    pub fn balance_sheet(&self) -> BalanceSheet {
        let mut total_assets = Decimal::ZERO;
        let mut total_liabilities = Decimal::ZERO;
        let mut current_earnings = Decimal::ZERO;
        let mut sections = Vec::with_capacity(self.coa_types.len());

        for node in &self.coa_types {
            let closing = node.totals.closing;
            match node.coa_type.normal_balance() {
                NormalBalance::Debit => total_assets += closing,
                NormalBalance::Credit => total_liabilities += closing,
            }
            if !node.coa_type.is_balance_sheet() {
                current_earnings += match node.coa_type.normal_balance() {
                    NormalBalance::Credit => closing,
                    NormalBalance::Debit => -closing,
                };
            }
            sections.push(BalanceSheetSection {
                coa_type: node.coa_type,
                total: closing,
                lines: node
                    .categories
                    .iter()
                    .map(|c| BalanceSheetLine {
                        code: c.code.clone(),
                        name: c.name.clone(),
                        amount: c.totals.closing,
                    })
                    .collect(),
            });
        }

        BalanceSheet {
            entity_code: self.entity_code.clone(),
            scope: self.scope,
            total_assets,
            total_liabilities,
            current_earnings,
            unmapped_total: self.unmapped.totals.closing,
            sections,
        }
    }
}

impl Display for TrialBalanceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt = |d: Decimal| to_display_string(d, NumberLocale::Indonesian);
        let mut table = Table::new();
        table.add_row(row!["Level", "Code", "Opening", "Debit", "Credit", "Closing"]);
        table.add_empty_row();

        let mut push = |level: &str, code: &str, t: &Totals| {
            table.add_row(row![level, code, fmt(t.opening), fmt(t.debit), fmt(t.credit), fmt(t.closing)]);
        };

        for coa in &self.coa_types {
            push("COA", coa.coa_type.code(), &coa.totals);
            for category in &coa.categories {
                push("  Category", &category.code, &category.totals);
                for sub in &category.sub_categories {
                    push("    Sub-category", &sub.code, &sub.totals);
                    for account in &sub.accounts {
                        push("      Account", &account.account_number, &account.totals);
                    }
                }
            }
        }
        if !self.unmapped.accounts.is_empty() {
            push("Unmapped", "", &self.unmapped.totals);
            for account in &self.unmapped.accounts {
                push("  Account", &account.account_number, &account.totals);
            }
        }
        push("Total", "", &self.grand_total);

        write!(f, "\nTrial balance {} ({})\n{}\n", self.entity_code, self.scope, table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheetLine {
    pub code: Arc<str>,
    pub name: Arc<str>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheetSection {
    pub coa_type: CoaType,
    pub total: Decimal,
    pub lines: Vec<BalanceSheetLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub entity_code: Arc<str>,
    pub scope: BalanceScope,
    /// Debit-normal side: assets plus expense.
    pub total_assets: Decimal,
    /// Credit-normal side: liabilities, equity and income.
    pub total_liabilities: Decimal,
    /// Income minus expense not yet closed into equity.
    pub current_earnings: Decimal,
    pub unmapped_total: Decimal,
    pub sections: Vec<BalanceSheetSection>,
}

impl Display for BalanceSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt = |d: Decimal| to_display_string(d, NumberLocale::Indonesian);
        let mut table = Table::new();
        table.add_row(row!["Section", "Code", "Name", "Amount"]);
        table.add_empty_row();

        for section in &self.sections {
            table.add_row(row![section.coa_type, "", "", fmt(section.total)]);
            for line in &section.lines {
                table.add_row(row!["", line.code, line.name, fmt(line.amount)]);
            }
        }
        table.add_empty_row();
        table.add_row(row!["Total assets", "", "", fmt(self.total_assets)]);
        table.add_row(row!["Total liabilities", "", "", fmt(self.total_liabilities)]);
        table.add_row(row!["Current earnings", "", "", fmt(self.current_earnings)]);
        table.add_row(row!["Unmapped", "", "", fmt(self.unmapped_total)]);

        write!(f, "\nBalance sheet {} ({})\n{}\n", self.entity_code, self.scope, table)
    }
}
