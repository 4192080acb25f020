//! Bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings. The lock contract on
//! the source chain and the token contract on the destination chain share this
//! interface: each emits one of the events and exposes one of the admin calls.

use alloy::sol;

sol! {
    /// Bridge contract interface seen by the relayer
    #[sol(rpc)]
    contract BridgeContract {
        /// Mint wrapped tokens for a verified source-chain deposit (admin only).
        /// Reverts if `depositId` was already minted.
        function mint(address user, uint256 amount, bytes32 depositId) external;

        /// Release locked tokens for a verified destination-chain burn (admin only).
        /// Reverts if `burnId` was already unlocked.
        function unlock(address user, uint256 amount, bytes32 burnId) external;

        /// Emitted by the source-chain lock contract on `deposit(amount, destinationAddress)`
        event Deposit(
            address indexed user,
            uint256 amount,
            bytes32 indexed depositId,
            string destinationChain,
            address destinationAddress
        );

        /// Emitted by the destination-chain token contract on `withdraw(amount, destinationAddress)`
        event Burn(
            address indexed user,
            uint256 amount,
            bytes32 indexed burnId,
            string destinationChain,
            address destinationAddress
        );
    }
}
