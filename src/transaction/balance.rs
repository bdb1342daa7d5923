//! Per-type balance math
//!
//! Pure functions: given a transaction and the locked participants, produce
//! the version-conditional writes the committer hands to the store.
//!
//! | Type              | Rule                                  | Failure               |
//! |-------------------|---------------------------------------|-----------------------|
//! | `transfer`        | source - amount, destination + amount | `InsufficientBalance` |
//! | `withdraw_full`   | source := 0                           | `AccountEmpty`        |
//! | `withdraw_amount` | source - amount                       | `InsufficientBalance` |
//! | `add_amount`      | source + amount                       | overflow only         |

use rust_decimal::Decimal;

use super::error::BankError;
use crate::models::{Account, Transaction, TransactionType};
use crate::store::BalanceWrite;

fn write(account: &Account, new_balance: Decimal) -> BalanceWrite {
    BalanceWrite {
        account_id: account.id,
        new_balance,
        expected_version: account.version,
    }
}

fn credit(account: &Account, amount: Decimal) -> Result<Decimal, BankError> {
    account
        .balance
        .checked_add(amount)
        .ok_or_else(|| BankError::InvalidAmount(format!("balance overflow on {}", account.id)))
}

fn debit(account: &Account, amount: Decimal) -> Result<Decimal, BankError> {
    if account.balance < amount {
        return Err(BankError::InsufficientBalance);
    }
    Ok(account.balance - amount)
}

/// Compute the writes for `tx`
///
/// `destination` must be `Some` for transfers and is ignored otherwise.
pub fn plan_balance_writes(
    tx: &Transaction,
    source: &Account,
    destination: Option<&Account>,
) -> Result<Vec<BalanceWrite>, BankError> {
    if source.id != tx.source_account_id {
        return Err(BankError::Validation(format!(
            "account {} is not the source of {}",
            source.id, tx.id
        )));
    }

    match tx.tx_type {
        TransactionType::Transfer => {
            let dest = destination.ok_or(BankError::MissingDestinationAccount)?;
            if tx.destination_account_id != Some(dest.id) {
                return Err(BankError::Validation(format!(
                    "account {} is not the destination of {}",
                    dest.id, tx.id
                )));
            }
            if dest.id == source.id {
                return Err(BankError::SameAccountTransfer);
            }
            let new_source = debit(source, tx.amount)?;
            let new_dest = credit(dest, tx.amount)?;
            Ok(vec![write(source, new_source), write(dest, new_dest)])
        }
        TransactionType::WithdrawFull => {
            if source.balance <= Decimal::ZERO {
                return Err(BankError::AccountEmpty);
            }
            Ok(vec![write(source, Decimal::ZERO)])
        }
        TransactionType::WithdrawAmount => Ok(vec![write(source, debit(source, tx.amount)?)]),
        TransactionType::AddAmount => Ok(vec![write(source, credit(source, tx.amount)?)]),
    }
}
