use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::sol;

use crate::error::{GhostpayError, Result};

// Subset of the ERC-20 interface the sweeper needs (USDT on BSC and Polygon).
sol! {
    #[sol(rpc)]
    interface ERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 value) external returns (bool);
        function decimals() external view returns (uint8);
    }
}

/// Query the token balance of `owner`.
pub async fn balance_of<P: Provider>(provider: &P, token: Address, owner: Address) -> Result<U256> {
    ERC20::new(token, provider)
        .balanceOf(owner)
        .call()
        .await
        .map_err(|e| GhostpayError::TransientChain(format!("balanceOf failed: {e}")))
}

/// Query the token's decimal places.
pub async fn decimals<P: Provider>(provider: &P, token: Address) -> Result<u8> {
    ERC20::new(token, provider)
        .decimals()
        .call()
        .await
        .map_err(|e| GhostpayError::TransientChain(format!("decimals failed: {e}")))
}

/// Submit `transfer(to, value)` signed by the provider's wallet.
/// Returns as soon as the node accepts the transaction; receipt waiting is the caller's job.
pub async fn transfer<P: Provider>(
    provider: &P,
    token: Address,
    to: Address,
    value: U256,
    gas_limit: u64,
    gas_price: u128,
) -> Result<TxHash> {
    let pending = ERC20::new(token, provider)
        .transfer(to, value)
        .gas(gas_limit)
        .gas_price(gas_price)
        .send()
        .await
        .map_err(|e| GhostpayError::TransientChain(format!("transfer send failed: {e}")))?;
    Ok(*pending.tx_hash())
}
