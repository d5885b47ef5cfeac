//! Virtual bank multisig bridge ABI
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge
//! contract and the ERC-20 subset the classifier needs.

use alloy::sol;

sol! {
    /// Multisig wallet holding bridged funds on the external chain
    #[sol(rpc)]
    contract VirtualBankMultiSig {
        /// User deposit towards a home-chain address
        function crossOut(string to, uint256 amount, address erc20) external payable returns (bool);

        /// Committee-signed withdrawal, keyed by the home-chain transaction hash
        function createOrSignWithdraw(
            string txKey,
            address to,
            uint256 amount,
            bool isContractAsset,
            address erc20,
            bytes signatures
        ) external;

        /// Committee-signed administrator set change
        function createOrSignManagerChange(
            string txKey,
            address[] adds,
            address[] removes,
            uint8 count,
            bytes signatures
        ) external;

        /// Committee-signed contract upgrade authorization
        function createOrSignUpgrade(string txKey, address upgradeContract, bytes signatures) external;

        /// Whether the bridge mints and burns this token
        function isMinterERC20(address erc20) external view returns (bool);

        event CrossOutFunds(address from, string to, uint256 amount, address erc20);
        event DepositFunds(address from, uint256 amount);
        event TxWithdrawCompleted(string txKey, address[] signers);
        event TxManagerChangeCompleted(string txKey, address[] signers);
        event TxUpgradeCompleted(string txKey, address[] signers);
    }

    #[sol(rpc)]
    contract IERC20 {
        function transfer(address to, uint256 value) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}
